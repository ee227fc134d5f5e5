use std::sync::Arc;
use anyhow::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{info, warn};
use cvfold_core::transform::{Interaction, Standardizer};
use cvfold_core::{
    BuildHandle, BuildListener, CrossValidatedModel, CvError, FoldAssignment, FoldOrchestrator, Frame, InMemoryCluster,
    JobConfig, NodeConfig, Parameters, TransformPipeline,
};
use crate::fitter::{LeastSquaresFitter, LinearModel};

struct LoggingListener;

impl BuildListener<LinearModel> for LoggingListener {
    fn on_model_success(&self, model: &CrossValidatedModel<LinearModel>) -> anyhow::Result<()> {
        let mses: Vec<f64> = model.fold_models().filter_map(|m| m.holdout_mse).collect();
        let cv_mse = mses.iter().sum::<f64>() / mses.len().max(1) as f64;
        let holdout_rows = model.holdout_predictions.as_ref().map(Vec::len);
        info!(lifecycle = %model.lifecycle_id, folds = model.total_folds(), cv_mse, ?holdout_rows, main = ?model.main_model, "cv_model_ready");
        Ok(())
    }

    fn on_model_failure(&self, cause: &CvError, params: &Parameters) -> anyhow::Result<()> {
        warn!(model = %params.model_id, %cause, "cv_model_failed");
        Ok(())
    }
}

/// One configured cross-validation job over synthetic data on an in-process cluster.
pub struct CvJobModule {
    cluster: Arc<InMemoryCluster>,
    pipeline: Arc<TransformPipeline>,
    orchestrator: FoldOrchestrator<LeastSquaresFitter>,
    job: JobConfig,
}

impl CvJobModule {
    pub async fn new(cfg: &NodeConfig) -> Result<Self> {
        let cluster = InMemoryCluster::new(cfg.cluster_members);
        let pipeline = Arc::new(TransformPipeline::new(vec![
            Arc::new(Interaction::new("x1", "x2")),
            Arc::new(Standardizer::new("std", vec!["x1".into(), "x1_x_x2".into()], cluster.clone()).with_retry(cfg.orchestrator.store_retry.clone())),
        ]));
        let orchestrator = FoldOrchestrator::new(Arc::new(LeastSquaresFitter::new("x1")), pipeline.clone(), cluster.clone(), Arc::new(LoggingListener))
            .with_config(cfg.orchestrator.clone());
        info!(members = cluster.member_ids().len(), transformers = pipeline.len(), "cv_job_module_initialized");
        Ok(Self { cluster, pipeline, orchestrator, job: cfg.job.clone() })
    }

    pub fn start(&self) -> Result<BuildHandle<LinearModel>> {
        let fold_assignment = match (&self.job.fold_column, self.job.scheme) {
            (Some(col), _) => FoldAssignment::with_column(col.clone()),
            (None, Some(scheme)) => FoldAssignment::with_scheme(scheme, self.job.total_folds),
            (None, None) => anyhow::bail!("job needs either a fold scheme or a fold column"),
        };
        let mut params = Parameters::new("least_squares", fold_assignment).with_response("y").with_seed(self.job.seed).with_holdout_predictions(4);
        params.build_main_model = self.job.build_main_model;
        let handle = self.orchestrator.start(params, self.synthetic_frame()?)?;
        info!(lifecycle = %handle.lifecycle_id(), folds = handle.total_folds(), "cv_job_started");
        Ok(handle)
    }

    // y = 3*x1 - x2 + noise; an optional fold column cycles through `total_folds` ids
    fn synthetic_frame(&self) -> Result<Frame> {
        let n = self.job.synthetic_rows;
        let mut rng = StdRng::seed_from_u64(self.job.seed);
        let x1: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let x2: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..2.0)).collect();
        let y: Vec<f64> = x1.iter().zip(&x2).map(|(a, b)| 3.0 * a - b + rng.gen_range(-0.1..0.1)).collect();
        let mut frame = Frame::new(vec![("x1".into(), x1), ("x2".into(), x2), ("y".into(), y)])?;
        if let Some(col) = &self.job.fold_column {
            let k = self.job.total_folds.max(2);
            frame.add_column(col.clone(), (0..n).map(|r| (r % k) as f64).collect())?;
        }
        Ok(frame)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.pipeline.remove().await?;
        info!(keys_left = self.cluster.keys().len(), "cv_job_module_shutdown");
        Ok(())
    }
}
