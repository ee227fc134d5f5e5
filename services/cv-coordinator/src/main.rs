use anyhow::Result;
use tracing::{info, warn};
use cvfold_core::{init_tracing, load_config, RunOutcome};

mod fitter;
mod job;

use job::CvJobModule;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("cv-coordinator")?;
    let cfg = load_config("cv-coordinator")?;
    info!(target: "cv-coordinator", members = cfg.cluster_members, folds = cfg.job.total_folds, policy = ?cfg.orchestrator.check_policy, "starting cv-coordinator");

    let module = CvJobModule::new(&cfg).await?;
    let mut handle = module.start()?;
    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            token.cancel();
        }
    });

    let outcome = handle.await_completion().await?;
    for (state, spent) in handle.durations() {
        info!(state = state.as_str(), spent_ms = spent.as_millis() as u64, "run_state_timing");
    }
    module.shutdown().await?;
    match outcome {
        RunOutcome::Succeeded(_) => Ok(()),
        RunOutcome::Failed(cause) => Err(anyhow::anyhow!("cross-validation failed: {cause}")),
        RunOutcome::Cancelled => {
            warn!("run cancelled");
            Ok(())
        }
    }
}
