//! Cross-validation fold orchestration.
//!
//! - `fold_plan`: fold assignment validation and per-row fold membership
//! - `transform`: stage-aware transformers sharing state through the store by lifecycle id
//! - `events`: bounded `ONE_DONE`/`ALL_DONE` channel between sub-jobs and the driver
//! - `consistency`: scatter/gather audit of cached copies of shared values
//! - `orchestrator`: runs one sub-job per holdout fold and reports to a `BuildListener`

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

pub mod config;
pub mod consistency;
pub mod error;
pub mod events;
pub mod fold_plan;
pub mod frame;
pub mod lifecycle;
pub mod metrics;
pub mod orchestrator;
pub mod resilience;
pub mod store;
pub mod transform;

pub use crate::config::{load_config, JobConfig, NodeConfig, OrchestratorConfig};
pub use consistency::{CheckPolicy, ConsistencyChecker, ConsistencyRecord};
pub use error::{CvError, Result as CvResult};
pub use events::{EventChannel, EventReceiver, EventSender, OverflowPolicy, TrainingEvent};
pub use fold_plan::{FoldAssignment, FoldMode, FoldPlan, FoldScheme};
pub use frame::Frame;
pub use lifecycle::{ModelLifecycleId, RunState};
pub use metrics::CV_METRICS;
pub use orchestrator::{BuildHandle, BuildListener, CrossValidatedModel, FitRequest, FoldOrchestrator, HoldoutPredictionCombiner, ModelBuildingResult, ModelFitter, NoopListener, Parameters, RunOutcome};
pub use resilience::{retry_async, RetryConfig};
pub use store::{InMemoryCluster, LocalCopy, MemberId, Store, StoreKey};
pub use transform::{DataTransformStage, DataTransformer, TransformContext, TransformPipeline};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber once: `EnvFilter` from `RUST_LOG` (default `info`),
/// human-readable output, or JSON lines when `CVFOLD_JSON_LOG` is `1`/`true`.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("CVFOLD_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let fmt_layer = if json {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .boxed()
        };
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "cvfold", service, "tracing initialized");
    Ok(())
}
