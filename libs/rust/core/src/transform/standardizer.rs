//! Mean/scale standardization with mean imputation of missing values.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::error::{CvError, Result};
use crate::frame::Frame;
use crate::lifecycle::ModelLifecycleId;
use crate::resilience::{retry_async, RetryConfig};
use crate::store::{Store, StoreKey};
use super::{DataTransformStage, DataTransformer, TransformContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardizerStats {
    pub columns: Vec<String>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub rows: usize,
}

pub struct Standardizer {
    name: String,
    columns: Vec<String>,
    store: Arc<dyn Store>,
    retry: RetryConfig,
    written: Mutex<Vec<StoreKey>>,
    removed: AtomicBool,
}

impl Standardizer {
    pub fn new(name: impl Into<String>, columns: Vec<String>, store: Arc<dyn Store>) -> Self {
        Self { name: name.into(), columns, store, retry: RetryConfig::default(), written: Mutex::new(Vec::new()), removed: AtomicBool::new(false) }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self { self.retry = retry; self }

    fn fit(&self, frame: &Frame) -> Result<StandardizerStats> {
        let mut means = Vec::with_capacity(self.columns.len());
        let mut scales = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            let values = frame.column(col).ok_or_else(|| CvError::Configuration(format!("{}: column `{col}` not in frame", self.name)))?;
            let present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
            let n = present.len() as f64;
            let mean = if present.is_empty() { 0.0 } else { present.iter().sum::<f64>() / n };
            let var = if present.len() < 2 { 0.0 } else { present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0) };
            means.push(mean);
            // constant columns are only centered
            scales.push(if var > 0.0 { var.sqrt() } else { 1.0 });
        }
        Ok(StandardizerStats { columns: self.columns.clone(), means, scales, rows: frame.nrows() })
    }

    fn apply(&self, mut frame: Frame, stats: &StandardizerStats) -> Result<Frame> {
        for (i, col) in stats.columns.iter().enumerate() {
            let idx = frame.index_of(col).ok_or_else(|| CvError::Configuration(format!("{}: column `{col}` not in frame", self.name)))?;
            for v in frame.column_mut(idx).iter_mut() {
                let x = if v.is_nan() { stats.means[i] } else { *v };
                *v = (x - stats.means[i]) / stats.scales[i];
            }
        }
        Ok(frame)
    }

    async fn load(&self, ctx: &TransformContext) -> Result<StandardizerStats> {
        let key = ctx.state_key(&self.name);
        let bytes = retry_async(&self.retry, "standardizer_load", |_| self.store.get(&key)).await?;
        match bytes {
            Some(b) => Ok(serde_json::from_slice(&b)?),
            None => Err(CvError::MissingTransformState {
                transformer: self.name.clone(),
                lifecycle_id: ctx.lifecycle_id().to_string(),
                fold: ctx.holdout_fold(),
            }),
        }
    }

    async fn save(&self, ctx: &TransformContext, stats: &StandardizerStats) -> Result<()> {
        let key = ctx.state_key(&self.name);
        let bytes = serde_json::to_vec(stats)?;
        retry_async(&self.retry, "standardizer_save", |_| self.store.put(&key, bytes.clone())).await?;
        let mut written = self.written.lock();
        if !written.contains(&key) { written.push(key); }
        Ok(())
    }
}

#[async_trait]
impl DataTransformer for Standardizer {
    fn name(&self) -> &str { &self.name }

    fn is_cv_sensitive(&self) -> bool { true }

    async fn transform(&self, frame: Frame, stage: DataTransformStage, ctx: Option<&TransformContext>) -> Result<Frame> {
        let Some(ctx) = ctx else {
            return match stage {
                DataTransformStage::Training => Err(CvError::Configuration(format!("{}: training requires a transform context", self.name))),
                _ => Err(CvError::MissingTransformState { transformer: self.name.clone(), lifecycle_id: "<none>".into(), fold: None }),
            };
        };
        let stats = match stage {
            DataTransformStage::Training => {
                let stats = self.fit(&frame)?;
                self.save(ctx, &stats).await?;
                debug!(transformer = %self.name, lifecycle = %ctx.lifecycle_id(), fold = ?ctx.holdout_fold(), rows = stats.rows, "stats_frozen");
                stats
            }
            DataTransformStage::Validation | DataTransformStage::Scoring => self.load(ctx).await?,
        };
        self.apply(frame, &stats)
    }

    fn allocated_keys(&self, lifecycle_id: &ModelLifecycleId) -> Vec<StoreKey> {
        let prefix = format!("transform/{lifecycle_id}/");
        self.written.lock().iter().filter(|k| k.as_str().starts_with(&prefix)).cloned().collect()
    }

    async fn remove(&self) -> Result<()> {
        if self.removed.load(Ordering::SeqCst) { return Ok(()); }
        // keys leave `written` only once deleted, so a failed call can be repeated
        let keys: Vec<StoreKey> = self.written.lock().clone();
        for key in &keys {
            retry_async(&self.retry, "standardizer_remove", |_| self.store.remove(key)).await?;
            self.written.lock().retain(|k| k != key);
        }
        self.removed.store(true, Ordering::SeqCst);
        debug!(transformer = %self.name, released = keys.len(), "transform_state_released");
        Ok(())
    }
}
