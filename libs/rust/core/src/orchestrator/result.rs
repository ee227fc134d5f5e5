use std::sync::Arc;
use chrono::{DateTime, Utc};
use tracing::debug;
use crate::error::{CvError, Result};
use crate::lifecycle::ModelLifecycleId;
use crate::resilience::{retry_async, RetryConfig};
use crate::store::Store;
use crate::transform::TransformContext;
use super::{model_key, Parameters};

/// Immutable outcome of one sub-job. At most one of model/cause is present.
#[derive(Debug, Clone)]
pub struct ModelBuildingResult<M> {
    model: Option<M>,
    cause: Option<Arc<CvError>>,
    params: Parameters,
    fold: Option<usize>,
    completed_at: DateTime<Utc>,
}

impl<M> ModelBuildingResult<M> {
    pub fn success(model: M, params: Parameters, fold: Option<usize>) -> Self {
        Self { model: Some(model), cause: None, params, fold, completed_at: Utc::now() }
    }

    pub fn failure(cause: Arc<CvError>, params: Parameters, fold: Option<usize>) -> Self {
        Self { model: None, cause: Some(cause), params, fold, completed_at: Utc::now() }
    }

    /// Neither model nor cause: an attempt that never reached a terminal state.
    pub fn empty(params: Parameters, fold: Option<usize>) -> Self {
        Self { model: None, cause: None, params, fold, completed_at: Utc::now() }
    }

    pub fn has_model(&self) -> bool { self.model.is_some() }
    pub fn is_terminal(&self) -> bool { self.model.is_some() || self.cause.is_some() }
    pub fn model(&self) -> Option<&M> { self.model.as_ref() }
    pub fn cause(&self) -> Option<&Arc<CvError>> { self.cause.as_ref() }
    pub fn params(&self) -> &Parameters { &self.params }
    pub fn fold(&self) -> Option<usize> { self.fold }
    pub fn completed_at(&self) -> DateTime<Utc> { self.completed_at }
}

/// Combined model reported to `on_model_success`.
#[derive(Debug, Clone)]
pub struct CrossValidatedModel<M> {
    pub lifecycle_id: ModelLifecycleId,
    pub params: Parameters,
    /// Per-fold results in fold order.
    pub fold_results: Vec<ModelBuildingResult<M>>,
    pub main_model: Option<M>,
    /// Combined holdout predictions in training-row order, when the build kept them.
    pub holdout_predictions: Option<Vec<f64>>,
}

impl<M> CrossValidatedModel<M> {
    pub fn fold_models(&self) -> impl Iterator<Item = &M> { self.fold_results.iter().filter_map(|r| r.model()) }

    pub fn total_folds(&self) -> usize { self.fold_results.len() }

    /// Context for scoring new data against the frozen main-model transform state.
    pub fn scoring_context(&self) -> TransformContext { TransformContext::new(self.lifecycle_id.clone()) }

    /// Removes every fold sub-model from the store and returns how many keys were released.
    /// The main model is kept. Repeating the call is harmless.
    pub async fn delete_cross_validation_models(&self, store: &dyn Store, retry: &RetryConfig) -> Result<usize> {
        for fold in 0..self.total_folds() {
            let key = model_key(&self.lifecycle_id, Some(fold));
            retry_async(retry, "cv_model_delete", |_| store.remove(&key)).await?;
        }
        debug!(lifecycle = %self.lifecycle_id, folds = self.total_folds(), "cv_models_deleted");
        Ok(self.total_folds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_hold_at_most_one_outcome() {
        let ok = ModelBuildingResult::success(1u8, Parameters::default(), Some(0));
        assert!(ok.has_model() && ok.cause().is_none() && ok.is_terminal());
        let err = ModelBuildingResult::<u8>::failure(Arc::new(CvError::Cancelled), Parameters::default(), Some(1));
        assert!(!err.has_model() && err.cause().is_some() && err.is_terminal());
        let pending = ModelBuildingResult::<u8>::empty(Parameters::default(), None);
        assert!(!pending.is_terminal());
    }

    #[tokio::test]
    async fn deleting_cv_models_keeps_the_main_model() {
        let store = crate::store::InMemoryCluster::new(2);
        let id = ModelLifecycleId::mint();
        for fold in [Some(0), Some(1), None] {
            crate::store::put_json(store.as_ref(), &model_key(&id, fold), &1u8).await.unwrap();
        }
        let model = CrossValidatedModel {
            lifecycle_id: id.clone(),
            params: Parameters::default(),
            fold_results: vec![ModelBuildingResult::success(1u8, Parameters::default(), Some(0)), ModelBuildingResult::success(2u8, Parameters::default(), Some(1))],
            main_model: Some(3u8),
            holdout_predictions: None,
        };
        assert_eq!(model.delete_cross_validation_models(store.as_ref(), &RetryConfig::none()).await.unwrap(), 2);
        assert_eq!(store.keys(), vec![model_key(&id, None)]);
        model.delete_cross_validation_models(store.as_ref(), &RetryConfig::none()).await.unwrap();
    }
}
