//! Fold assignment schemes and per-row fold membership.

use std::collections::BTreeMap;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use crate::error::{CvError, Result};
use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FoldScheme {
    #[serde(rename = "AUTO")]
    Auto,
    Random,
    Modulo,
    Stratified,
}

/// Wire form of a fold assignment. `-1` marks an unused count or holdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldAssignment {
    pub scheme: Option<FoldScheme>,
    pub fold_column: Option<String>,
    pub total_folds: i32,
    pub holdout_fold: i32,
}

impl Default for FoldAssignment {
    fn default() -> Self { Self { scheme: None, fold_column: None, total_folds: -1, holdout_fold: -1 } }
}

/// Validated form: exactly one way of assigning folds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldMode {
    Arithmetic { scheme: FoldScheme, total_folds: usize },
    Column(String),
}

impl FoldAssignment {
    pub fn with_scheme(scheme: FoldScheme, total_folds: usize) -> Self {
        Self { scheme: Some(scheme), total_folds: total_folds as i32, ..Default::default() }
    }

    pub fn with_column(column: impl Into<String>) -> Self {
        Self { fold_column: Some(column.into()), ..Default::default() }
    }

    pub fn holdout(&self) -> Option<usize> { usize::try_from(self.holdout_fold).ok() }

    /// The per-sub-job view of this assignment.
    pub fn for_holdout(&self, fold: usize, total_folds: usize) -> Self {
        Self { holdout_fold: fold as i32, total_folds: total_folds as i32, ..self.clone() }
    }

    pub fn validate(&self) -> Result<FoldMode> {
        if self.holdout_fold != -1 {
            return Err(CvError::Configuration(format!("holdout_fold must be -1 when submitting a build, got {}", self.holdout_fold)));
        }
        match (&self.scheme, &self.fold_column) {
            (Some(_), Some(col)) => Err(CvError::Configuration(format!("fold scheme and fold column `{col}` are mutually exclusive"))),
            (None, None) => Err(CvError::Configuration("either a fold scheme or a fold column is required".into())),
            (Some(scheme), None) => {
                if self.total_folds < 2 {
                    return Err(CvError::Configuration(format!("total_folds must be >= 2 for scheme {scheme:?}, got {}", self.total_folds)));
                }
                Ok(FoldMode::Arithmetic { scheme: *scheme, total_folds: self.total_folds as usize })
            }
            (None, Some(col)) => {
                if self.total_folds != -1 {
                    return Err(CvError::Configuration(format!("total_folds is derived from fold column `{col}` and must be -1, got {}", self.total_folds)));
                }
                if col.is_empty() { return Err(CvError::Configuration("fold column name is empty".into())); }
                Ok(FoldMode::Column(col.clone()))
            }
        }
    }
}

/// Fold membership of every training row. `None` rows are never held out.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldPlan {
    assignments: Vec<Option<usize>>,
    total_folds: usize,
}

impl FoldPlan {
    pub fn compute(frame: &Frame, mode: &FoldMode, response: Option<&str>, seed: u64) -> Result<Self> {
        let nrows = frame.nrows();
        match mode {
            FoldMode::Arithmetic { scheme, total_folds } => {
                let k = *total_folds;
                if k > nrows {
                    return Err(CvError::Configuration(format!("total_folds ({k}) exceeds training rows ({nrows})")));
                }
                let assignments = match scheme {
                    FoldScheme::Modulo => (0..nrows).map(|r| Some(r % k)).collect(),
                    FoldScheme::Auto | FoldScheme::Random => {
                        let mut rng = StdRng::seed_from_u64(seed);
                        (0..nrows).map(|_| Some(rng.gen_range(0..k))).collect()
                    }
                    FoldScheme::Stratified => {
                        let col = response.ok_or_else(|| CvError::Configuration("stratified folds need a response column".into()))?;
                        let y = frame.column(col).ok_or_else(|| CvError::Configuration(format!("response column `{col}` not in frame")))?;
                        stratified(y, k, seed)
                    }
                };
                Ok(Self { assignments, total_folds: k })
            }
            FoldMode::Column(col) => {
                let values = frame.column(col).ok_or_else(|| CvError::Configuration(format!("fold column `{col}` not in frame")))?;
                let mut levels: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
                levels.sort_by(|a, b| a.total_cmp(b));
                levels.dedup();
                if levels.len() < 2 {
                    return Err(CvError::Configuration(format!("fold column `{col}` must contain at least 2 distinct values, found {}", levels.len())));
                }
                let assignments = values.iter()
                    .map(|v| if v.is_nan() { None } else { levels.binary_search_by(|l| l.total_cmp(v)).ok() })
                    .collect();
                Ok(Self { assignments, total_folds: levels.len() })
            }
        }
    }

    pub fn total_folds(&self) -> usize { self.total_folds }

    pub fn nrows(&self) -> usize { self.assignments.len() }

    pub fn fold_of(&self, row: usize) -> Option<usize> { self.assignments.get(row).copied().flatten() }

    pub fn holdout_rows(&self, fold: usize) -> Vec<usize> {
        self.assignments.iter().enumerate().filter(|(_, a)| **a == Some(fold)).map(|(r, _)| r).collect()
    }

    pub fn training_rows(&self, fold: usize) -> Vec<usize> {
        self.assignments.iter().enumerate().filter(|(_, a)| **a != Some(fold)).map(|(r, _)| r).collect()
    }

    pub fn fold_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.total_folds];
        for f in self.assignments.iter().flatten() { sizes[*f] += 1; }
        sizes
    }

    /// (training split, holdout split) for `fold`.
    pub fn split(&self, frame: &Frame, fold: usize) -> (Frame, Frame) {
        (frame.select_rows(&self.training_rows(fold)), frame.select_rows(&self.holdout_rows(fold)))
    }
}

fn stratified(y: &[f64], k: usize, seed: u64) -> Vec<Option<usize>> {
    let mut classes: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (row, v) in y.iter().enumerate() {
        let class = if v.is_nan() { u64::MAX } else { v.to_bits() };
        classes.entry(class).or_default().push(row);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = vec![None; y.len()];
    let mut next = 0usize;
    for rows in classes.values_mut() {
        rows.shuffle(&mut rng);
        for row in rows.iter() {
            out[*row] = Some(next % k);
            next += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: usize) -> Frame {
        Frame::new(vec![
            ("x".into(), (0..n).map(|i| i as f64).collect()),
            ("y".into(), (0..n).map(|i| (i % 3) as f64).collect()),
        ]).unwrap()
    }

    #[test]
    fn rejects_scheme_and_column_together() {
        let fa = FoldAssignment { scheme: Some(FoldScheme::Random), fold_column: Some("myFold".into()), total_folds: 5, holdout_fold: -1 };
        assert!(matches!(fa.validate(), Err(CvError::Configuration(_))));
    }

    #[test]
    fn rejects_neither_and_small_fold_counts() {
        assert!(FoldAssignment::default().validate().is_err());
        assert!(FoldAssignment::with_scheme(FoldScheme::Modulo, 1).validate().is_err());
        let mut fa = FoldAssignment::with_scheme(FoldScheme::Modulo, 3);
        fa.holdout_fold = 0;
        assert!(fa.validate().is_err());
    }

    #[test]
    fn modulo_assigns_round_robin() {
        let mode = FoldAssignment::with_scheme(FoldScheme::Modulo, 3).validate().unwrap();
        let plan = FoldPlan::compute(&frame(7), &mode, None, 0).unwrap();
        assert_eq!(plan.holdout_rows(1), vec![1, 4]);
        assert_eq!(plan.fold_sizes(), vec![3, 2, 2]);
    }

    #[test]
    fn random_is_seeded() {
        let mode = FoldAssignment::with_scheme(FoldScheme::Random, 4).validate().unwrap();
        let a = FoldPlan::compute(&frame(50), &mode, None, 42).unwrap();
        let b = FoldPlan::compute(&frame(50), &mode, None, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fold_sizes().iter().sum::<usize>(), 50);
    }

    #[test]
    fn stratified_balances_each_class() {
        let mode = FoldAssignment::with_scheme(FoldScheme::Stratified, 3).validate().unwrap();
        let f = frame(30);
        let plan = FoldPlan::compute(&f, &mode, Some("y"), 7).unwrap();
        let y = f.column("y").unwrap();
        for fold in 0..3 {
            let rows = plan.holdout_rows(fold);
            for class in 0..3 {
                let n = rows.iter().filter(|r| y[**r] == class as f64).count();
                assert!((3..=4).contains(&n), "fold {fold} class {class} got {n}");
            }
        }
    }

    #[test]
    fn stratified_requires_response() {
        let mode = FoldAssignment::with_scheme(FoldScheme::Stratified, 3).validate().unwrap();
        assert!(FoldPlan::compute(&frame(9), &mode, None, 0).is_err());
    }

    #[test]
    fn fold_column_skips_unused_levels_and_missing_rows() {
        let f = Frame::new(vec![("fold".into(), vec![1.0, 3.0, 1.0, f64::NAN])]).unwrap();
        let mode = FoldAssignment::with_column("fold").validate().unwrap();
        let plan = FoldPlan::compute(&f, &mode, None, 0).unwrap();
        assert_eq!(plan.total_folds(), 2);
        assert_eq!(plan.fold_of(1), Some(1));
        assert_eq!(plan.fold_of(3), None);
        assert_eq!(plan.training_rows(0), vec![1, 3]);
    }

    #[test]
    fn fold_column_needs_two_levels() {
        let f = Frame::new(vec![("fold".into(), vec![2.0, 2.0])]).unwrap();
        let mode = FoldAssignment::with_column("fold").validate().unwrap();
        assert!(FoldPlan::compute(&f, &mode, None, 0).is_err());
    }

    #[test]
    fn wire_form_uses_sentinels() {
        let json = serde_json::to_value(FoldAssignment::with_scheme(FoldScheme::Auto, 5)).unwrap();
        assert_eq!(json["scheme"], "AUTO");
        assert_eq!(json["holdoutFold"], -1);
        assert!(json["foldColumn"].is_null());
    }
}
