use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use cvfold_core::{FitRequest, Frame, ModelFitter};

/// Univariate least squares on a single feature.
#[derive(Debug, Clone, Serialize)]
pub struct LinearModel {
    pub feature: String,
    pub intercept: f64,
    pub slope: f64,
    pub train_rows: usize,
    pub holdout_mse: Option<f64>,
}

impl LinearModel {
    pub fn predict(&self, x: f64) -> f64 { self.intercept + self.slope * x }
}

pub struct LeastSquaresFitter {
    feature: String,
}

impl LeastSquaresFitter {
    pub fn new(feature: impl Into<String>) -> Self { Self { feature: feature.into() } }

    fn columns<'a>(&self, frame: &'a Frame, response: &str) -> Result<(&'a [f64], &'a [f64])> {
        let x = frame.column(&self.feature).ok_or_else(|| anyhow!("feature `{}` missing", self.feature))?;
        let y = frame.column(response).ok_or_else(|| anyhow!("response `{response}` missing"))?;
        Ok((x, y))
    }
}

#[async_trait]
impl ModelFitter for LeastSquaresFitter {
    type Model = LinearModel;

    async fn fit(&self, req: FitRequest<'_>) -> Result<LinearModel> {
        let response = req.params.response_column.as_deref().ok_or_else(|| anyhow!("no response column"))?;
        let (x, y) = self.columns(req.train, response)?;
        let n = x.len() as f64;
        if x.len() < 2 { anyhow::bail!("need at least 2 training rows, got {}", x.len()); }
        let (mx, my) = (x.iter().sum::<f64>() / n, y.iter().sum::<f64>() / n);
        let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
        let sxx: f64 = x.iter().map(|a| (a - mx).powi(2)).sum();
        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
        let mut model = LinearModel { feature: self.feature.clone(), intercept: my - slope * mx, slope, train_rows: x.len(), holdout_mse: None };
        if let Some(holdout) = req.holdout {
            let (hx, hy) = self.columns(holdout, response)?;
            if !hx.is_empty() {
                let sse: f64 = hx.iter().zip(hy).map(|(a, b)| (model.predict(*a) - b).powi(2)).sum();
                model.holdout_mse = Some(sse / hx.len() as f64);
            }
        }
        Ok(model)
    }

    fn predict_holdout(&self, model: &LinearModel, holdout: &Frame) -> Option<Vec<f64>> {
        holdout.column(&model.feature).map(|x| x.iter().map(|v| model.predict(*v)).collect())
    }
}
