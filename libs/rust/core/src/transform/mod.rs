//! Stage-aware data transformation.
//!
//! Transformers compute statistics at `Training` and replay the frozen statistics at
//! `Validation`/`Scoring`. Any state lives in the shared store, keyed by lifecycle id,
//! transformer name and (for fold sub-jobs) the holdout fold, so one transformer
//! instance can serve every concurrently running fold.

pub mod pipeline;
pub mod standardizer;
pub mod interaction;

pub use pipeline::TransformPipeline;
pub use standardizer::{Standardizer, StandardizerStats};
pub use interaction::Interaction;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::Result;
use crate::fold_plan::{FoldAssignment, FoldScheme};
use crate::frame::Frame;
use crate::lifecycle::ModelLifecycleId;
use crate::store::StoreKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataTransformStage { Training, Validation, Scoring }

#[derive(Debug, Clone, PartialEq)]
pub struct TransformContext {
    lifecycle_id: ModelLifecycleId,
    cv: Option<FoldAssignment>,
}

impl TransformContext {
    /// Context for the main model and for scoring.
    pub fn new(lifecycle_id: ModelLifecycleId) -> Self { Self { lifecycle_id, cv: None } }

    /// Context for the sub-job holding out `fold` of `total_folds`.
    pub fn for_fold(lifecycle_id: ModelLifecycleId, assignment: &FoldAssignment, fold: usize, total_folds: usize) -> Self {
        Self { lifecycle_id, cv: Some(assignment.for_holdout(fold, total_folds)) }
    }

    pub fn lifecycle_id(&self) -> &ModelLifecycleId { &self.lifecycle_id }
    pub fn is_cv_model(&self) -> bool { self.cv.is_some() }

    /// Requested fold count; `None` for fold-column builds.
    pub fn n_folds(&self) -> Option<usize> {
        self.cv.as_ref().filter(|a| a.scheme.is_some()).and_then(|a| usize::try_from(a.total_folds).ok())
    }

    pub fn fold_assignment(&self) -> Option<FoldScheme> { self.cv.as_ref().and_then(|a| a.scheme) }
    pub fn fold_column(&self) -> Option<&str> { self.cv.as_ref().and_then(|a| a.fold_column.as_deref()) }
    pub fn holdout_fold(&self) -> Option<usize> { self.cv.as_ref().and_then(|a| a.holdout()) }
    pub fn total_folds(&self) -> Option<usize> { self.cv.as_ref().and_then(|a| usize::try_from(a.total_folds).ok()) }

    /// Key for state owned by `transformer` under this context's lifecycle and fold.
    pub fn state_key(&self, transformer: &str) -> StoreKey {
        state_key(&self.lifecycle_id, transformer, self.holdout_fold())
    }
}

pub fn state_key(lifecycle_id: &ModelLifecycleId, transformer: &str, fold: Option<usize>) -> StoreKey {
    match fold {
        Some(f) => StoreKey::new(format!("transform/{lifecycle_id}/{transformer}/fold-{f}")),
        None => StoreKey::new(format!("transform/{lifecycle_id}/{transformer}/main")),
    }
}

#[async_trait]
pub trait DataTransformer: Send + Sync {
    fn name(&self) -> &str;

    /// True when the transformer must see each fold's training split separately.
    fn is_cv_sensitive(&self) -> bool { false }

    async fn transform(&self, frame: Frame, stage: DataTransformStage, ctx: Option<&TransformContext>) -> Result<Frame>;

    /// Shared keys this transformer wrote for `lifecycle_id`.
    fn allocated_keys(&self, _lifecycle_id: &ModelLifecycleId) -> Vec<StoreKey> { Vec::new() }

    /// Release distributed resources. Must be idempotent.
    async fn remove(&self) -> Result<()> { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_context_exposes_cv_metadata() {
        let id = ModelLifecycleId::from("lc-1");
        let fa = FoldAssignment::with_scheme(FoldScheme::Modulo, 4);
        let ctx = TransformContext::for_fold(id.clone(), &fa, 2, 4);
        assert!(ctx.is_cv_model());
        assert_eq!(ctx.holdout_fold(), Some(2));
        assert_eq!(ctx.n_folds(), Some(4));
        assert_eq!(ctx.total_folds(), Some(4));
        assert_eq!(ctx.fold_assignment(), Some(FoldScheme::Modulo));
        assert_eq!(ctx.fold_column(), None);
        assert_eq!(ctx.state_key("std").as_str(), "transform/lc-1/std/fold-2");
        assert_eq!(TransformContext::new(id).state_key("std").as_str(), "transform/lc-1/std/main");
    }

    #[test]
    fn column_context_has_no_requested_fold_count() {
        let fa = FoldAssignment::with_column("f");
        let ctx = TransformContext::for_fold(ModelLifecycleId::mint(), &fa, 0, 3);
        assert_eq!(ctx.n_folds(), None);
        assert_eq!(ctx.total_folds(), Some(3));
        assert_eq!(ctx.fold_column(), Some("f"));
    }
}
