use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, warn};
use crate::error::CvError;
use crate::lifecycle::ModelLifecycleId;
use super::{CrossValidatedModel, Parameters};

/// Outcome callbacks, registered before `start()`. Called from the run's completion path:
/// implementations must return promptly.
pub trait BuildListener<M>: Send + Sync {
    fn on_model_success(&self, model: &CrossValidatedModel<M>) -> anyhow::Result<()>;
    fn on_model_failure(&self, cause: &CvError, params: &Parameters) -> anyhow::Result<()>;
}

pub struct NoopListener;

impl<M> BuildListener<M> for NoopListener {
    fn on_model_success(&self, _model: &CrossValidatedModel<M>) -> anyhow::Result<()> { Ok(()) }
    fn on_model_failure(&self, _cause: &CvError, _params: &Parameters) -> anyhow::Result<()> { Ok(()) }
}

// Listener errors and panics are logged and never reach orchestrator state.
pub(crate) fn notify_success<M>(listener: &dyn BuildListener<M>, model: &CrossValidatedModel<M>) {
    let lifecycle = &model.lifecycle_id;
    match catch_unwind(AssertUnwindSafe(|| listener.on_model_success(model))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(%lifecycle, error = %e, "on_model_success returned an error"),
        Err(panic) => error!(%lifecycle, panic = panic_message(&panic), "on_model_success panicked"),
    }
}

pub(crate) fn notify_failure<M>(listener: &dyn BuildListener<M>, lifecycle: &ModelLifecycleId, cause: &CvError, params: &Parameters) {
    match catch_unwind(AssertUnwindSafe(|| listener.on_model_failure(cause, params))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(%lifecycle, error = %e, "on_model_failure returned an error"),
        Err(panic) => error!(%lifecycle, panic = panic_message(&panic), "on_model_failure panicked"),
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic.downcast_ref::<&str>().map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}
