//! Reassembly of per-fold holdout predictions in training-row order.

use std::collections::BTreeMap;
use anyhow::anyhow;
use crate::error::{CvError, Result};
use crate::fold_plan::FoldPlan;

/// Places every fold's holdout predictions back at the rows that fold held out.
///
/// A non-zero `precision` rounds each value to that many decimal places, which keeps
/// the combined column small when it is retained next to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HoldoutPredictionCombiner {
    precision: u32,
}

impl HoldoutPredictionCombiner {
    pub fn new(precision: u32) -> Self { Self { precision } }

    pub fn precision(&self) -> u32 { self.precision }

    pub fn is_approximating(&self) -> bool { self.precision > 0 }

    pub fn approximate(&self, value: f64) -> f64 {
        if !self.is_approximating() || !value.is_finite() { return value; }
        let scale = 10f64.powi(self.precision.min(308) as i32);
        let scaled = value * scale;
        if !scaled.is_finite() { return value; }
        scaled.round() / scale
    }

    /// One value per training row. Rows outside every fold stay NaN.
    pub fn combine(&self, plan: &FoldPlan, per_fold: &BTreeMap<usize, Vec<f64>>) -> Result<Vec<f64>> {
        let mut combined = vec![f64::NAN; plan.nrows()];
        for fold in 0..plan.total_folds() {
            let preds = per_fold.get(&fold)
                .ok_or_else(|| CvError::fold_build(fold, anyhow!("no holdout predictions")))?;
            let rows = plan.holdout_rows(fold);
            if rows.len() != preds.len() {
                return Err(CvError::fold_build(fold, anyhow!("{} holdout predictions for {} holdout rows", preds.len(), rows.len())));
            }
            for (row, p) in rows.into_iter().zip(preds) { combined[row] = self.approximate(*p); }
        }
        Ok(combined)
    }
}
