use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};
use crate::error::Result;
use crate::frame::Frame;
use crate::lifecycle::ModelLifecycleId;
use crate::store::StoreKey;
use super::{DataTransformStage, DataTransformer, TransformContext};

/// Ordered list of transformers applied as one unit.
pub struct TransformPipeline {
    transformers: Vec<Arc<dyn DataTransformer>>,
    removed: AtomicBool,
}

impl Default for TransformPipeline {
    fn default() -> Self { Self::new(Vec::new()) }
}

impl TransformPipeline {
    pub fn new(transformers: Vec<Arc<dyn DataTransformer>>) -> Self { Self { transformers, removed: AtomicBool::new(false) } }

    pub fn len(&self) -> usize { self.transformers.len() }
    pub fn is_empty(&self) -> bool { self.transformers.is_empty() }

    /// Whether any transformer needs per-fold training statistics.
    pub fn is_cv_sensitive(&self) -> bool { self.transformers.iter().any(|t| t.is_cv_sensitive()) }

    #[instrument(skip(self, frame, ctx), level = "debug", fields(lifecycle = ?ctx.map(|c| c.lifecycle_id().as_str()), fold = ?ctx.and_then(|c| c.holdout_fold())))]
    pub async fn transform(&self, frame: Frame, stage: DataTransformStage, ctx: Option<&TransformContext>) -> Result<Frame> {
        let mut frame = frame;
        for t in &self.transformers {
            let s = Instant::now();
            frame = t.transform(frame, stage, ctx).await?;
            debug!(transformer = t.name(), ?stage, elapsed_ms = s.elapsed().as_secs_f64() * 1000.0, "transform_applied");
        }
        Ok(frame)
    }

    /// Scoring without a context; only stateless transformers can succeed here.
    pub async fn transform_default(&self, frame: Frame) -> Result<Frame> {
        self.transform(frame, DataTransformStage::Scoring, None).await
    }

    pub fn allocated_keys(&self, lifecycle_id: &ModelLifecycleId) -> Vec<StoreKey> {
        let mut keys: Vec<StoreKey> = self.transformers.iter().flat_map(|t| t.allocated_keys(lifecycle_id)).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Releases every transformer's resources. Once every transformer released cleanly,
    /// later calls are no-ops; after a failure the next call retries what is left.
    pub async fn remove(&self) -> Result<()> {
        if self.removed.load(Ordering::SeqCst) { return Ok(()); }
        for t in &self.transformers { t.remove().await?; }
        self.removed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
