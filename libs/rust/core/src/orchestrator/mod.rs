//! Cross-validated model builds.
//!
//! `FoldOrchestrator::start` validates the fold assignment, computes the fold plan and
//! spawns one sub-job per holdout fold. Sub-jobs transform their splits, fit a model and
//! post `ONE_DONE`; the driver counts those events, aggregates the per-fold results,
//! audits the shared keys the run mutated and reports to the `BuildListener`.

mod coordinator;
mod handle;
mod holdout;
mod listener;
mod result;

pub use coordinator::{model_key, FoldOrchestrator};
pub use handle::{BuildHandle, RunOutcome};
pub use holdout::HoldoutPredictionCombiner;
pub use listener::{BuildListener, NoopListener};
pub use result::{CrossValidatedModel, ModelBuildingResult};

use std::collections::BTreeMap;
use std::fmt::Debug;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::fold_plan::FoldAssignment;
use crate::frame::Frame;
use crate::transform::TransformContext;

/// Build request. Hyperparameters are opaque to the orchestrator and passed to the fitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Parameters {
    pub model_id: String,
    pub response_column: Option<String>,
    pub hyperparameters: BTreeMap<String, Value>,
    pub fold_assignment: FoldAssignment,
    pub seed: u64,
    /// Fit a final model on the full training frame once every fold succeeded.
    pub build_main_model: bool,
    /// Leave the fold sub-models in the store after a successful run.
    pub keep_cross_validation_models: bool,
    /// Combine the fitter's holdout predictions into one column in training-row order.
    pub keep_cross_validation_predictions: bool,
    /// Decimal places kept in combined holdout predictions; 0 keeps them exact.
    pub holdout_predictions_precision: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            model_id: "model".into(), response_column: None, hyperparameters: BTreeMap::new(), fold_assignment: FoldAssignment::default(), seed: 0, build_main_model: true,
            keep_cross_validation_models: true, keep_cross_validation_predictions: false, holdout_predictions_precision: 0,
        }
    }
}

impl Parameters {
    pub fn new(model_id: impl Into<String>, fold_assignment: FoldAssignment) -> Self {
        Self { model_id: model_id.into(), fold_assignment, ..Default::default() }
    }

    pub fn with_response(mut self, column: impl Into<String>) -> Self { self.response_column = Some(column.into()); self }

    pub fn with_hyperparameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.hyperparameters.insert(name.into(), value.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self { self.seed = seed; self }

    pub fn without_main_model(mut self) -> Self { self.build_main_model = false; self }

    /// Delete the fold sub-models from the store once the run succeeded.
    pub fn without_cross_validation_models(mut self) -> Self { self.keep_cross_validation_models = false; self }

    pub fn with_holdout_predictions(mut self, precision: u32) -> Self {
        self.keep_cross_validation_predictions = true;
        self.holdout_predictions_precision = precision;
        self
    }

    /// Copy handed to the sub-job holding out `fold`.
    pub fn for_fold(&self, fold: usize, total_folds: usize) -> Self {
        Self {
            model_id: format!("{}_cv_{}", self.model_id, fold + 1),
            fold_assignment: self.fold_assignment.for_holdout(fold, total_folds),
            ..self.clone()
        }
    }
}

/// Inputs of one fit. `holdout` is absent for the main model.
pub struct FitRequest<'a> {
    pub train: &'a Frame,
    pub holdout: Option<&'a Frame>,
    pub params: &'a Parameters,
    pub ctx: &'a TransformContext,
}

/// The model-fitting routine plugged into the orchestrator.
#[async_trait]
pub trait ModelFitter: Send + Sync + 'static {
    type Model: Clone + Debug + Send + Sync + Serialize + 'static;

    async fn fit(&self, req: FitRequest<'_>) -> anyhow::Result<Self::Model>;

    /// One prediction per holdout row, used when the build keeps cross-validation
    /// predictions. Fitters that cannot predict return `None`.
    fn predict_holdout(&self, _model: &Self::Model, _holdout: &Frame) -> Option<Vec<f64>> { None }
}
