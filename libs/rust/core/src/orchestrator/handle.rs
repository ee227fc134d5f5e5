use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::error::{CvError, Result};
use crate::lifecycle::{ModelLifecycleId, RunLifecycle, RunState};
use crate::store::StoreKey;
use super::{CrossValidatedModel, ModelBuildingResult};

/// Terminal outcome of one orchestrator run.
#[derive(Debug, Clone)]
pub enum RunOutcome<M> {
    Succeeded(Arc<CrossValidatedModel<M>>),
    Failed(Arc<CvError>),
    Cancelled,
}

impl<M> RunOutcome<M> {
    pub fn state(&self) -> RunState {
        match self {
            RunOutcome::Succeeded(_) => RunState::Succeeded,
            RunOutcome::Failed(_) => RunState::Failed,
            RunOutcome::Cancelled => RunState::Cancelled,
        }
    }

    pub fn model(&self) -> Option<&Arc<CrossValidatedModel<M>>> {
        match self { RunOutcome::Succeeded(m) => Some(m), _ => None }
    }

    pub fn cause(&self) -> Option<&Arc<CvError>> {
        match self { RunOutcome::Failed(c) => Some(c), _ => None }
    }
}

/// State shared between the driver, the sub-jobs and the handle.
pub(crate) struct RunShared<M> {
    lifecycle: Mutex<RunLifecycle>,
    state_tx: watch::Sender<RunState>,
    results: Mutex<BTreeMap<usize, ModelBuildingResult<M>>>,
    failures: Mutex<Vec<(usize, Arc<CvError>)>>,
    mutated: Mutex<Vec<StoreKey>>,
    predictions: Mutex<BTreeMap<usize, Vec<f64>>>,
    completed_tx: watch::Sender<usize>,
    dispatched: AtomicUsize,
    one_done: AtomicUsize,
}

impl<M: Clone> RunShared<M> {
    pub(crate) fn new() -> Self {
        let (state_tx, _) = watch::channel(RunState::Planned);
        let (completed_tx, _) = watch::channel(0);
        Self {
            lifecycle: Mutex::new(RunLifecycle::new()),
            state_tx,
            results: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(Vec::new()),
            mutated: Mutex::new(Vec::new()),
            predictions: Mutex::new(BTreeMap::new()),
            completed_tx,
            dispatched: AtomicUsize::new(0),
            one_done: AtomicUsize::new(0),
        }
    }

    pub(crate) fn advance(&self, next: RunState) -> bool {
        let moved = self.lifecycle.lock().advance(next);
        if moved { self.state_tx.send_replace(next); }
        moved
    }

    pub(crate) fn state(&self) -> RunState { self.lifecycle.lock().state() }

    pub(crate) fn record(&self, fold: usize, result: ModelBuildingResult<M>) {
        if let Some(cause) = result.cause() { self.failures.lock().push((fold, cause.clone())); }
        let completed = {
            let mut results = self.results.lock();
            results.insert(fold, result);
            results.len()
        };
        self.completed_tx.send_replace(completed);
    }

    /// Cause of the earliest recorded failure.
    pub(crate) fn first_failure(&self) -> Option<(usize, Arc<CvError>)> { self.failures.lock().first().cloned() }

    pub(crate) fn results(&self) -> Vec<ModelBuildingResult<M>> { self.results.lock().values().cloned().collect() }

    pub(crate) fn mark_mutated(&self, key: StoreKey) { self.mutated.lock().push(key); }

    pub(crate) fn mutated(&self) -> Vec<StoreKey> { self.mutated.lock().clone() }

    pub(crate) fn record_predictions(&self, fold: usize, preds: Vec<f64>) { self.predictions.lock().insert(fold, preds); }

    pub(crate) fn predictions(&self) -> BTreeMap<usize, Vec<f64>> { self.predictions.lock().clone() }

    pub(crate) fn mark_dispatched(&self) { self.dispatched.fetch_add(1, Ordering::SeqCst); }

    pub(crate) fn mark_one_done(&self) { self.one_done.fetch_add(1, Ordering::SeqCst); }
}

/// Caller's view of a running build: observe progress, cancel, await the outcome.
pub struct BuildHandle<M> {
    lifecycle_id: ModelLifecycleId,
    total_folds: usize,
    shared: Arc<RunShared<M>>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<RunOutcome<M>>>,
    outcome: Option<RunOutcome<M>>,
}

impl<M: Clone + Send + Sync + 'static> BuildHandle<M> {
    pub(crate) fn new(lifecycle_id: ModelLifecycleId, total_folds: usize, shared: Arc<RunShared<M>>, cancel: CancellationToken, driver: JoinHandle<RunOutcome<M>>) -> Self {
        Self { lifecycle_id, total_folds, shared, cancel, driver: Some(driver), outcome: None }
    }

    pub fn lifecycle_id(&self) -> &ModelLifecycleId { &self.lifecycle_id }
    pub fn total_folds(&self) -> usize { self.total_folds }
    pub fn state(&self) -> RunState { self.shared.state() }

    /// Signals every in-flight sub-job to stop at its next checkpoint. Results already
    /// recorded stay readable through `results()` but the run ends `Cancelled`.
    pub fn cancel(&self) { self.cancel.cancel(); }
    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }
    /// Token that cancels this run, for signal handlers and supervisors.
    pub fn cancellation_token(&self) -> CancellationToken { self.cancel.clone() }

    /// Results recorded so far, in fold order.
    pub fn results(&self) -> Vec<ModelBuildingResult<M>> { self.shared.results() }

    pub fn completed_folds(&self) -> usize { *self.shared.completed_tx.borrow() }
    pub fn dispatched(&self) -> usize { self.shared.dispatched.load(Ordering::SeqCst) }
    /// `ONE_DONE` events counted by the driver.
    pub fn one_done_observed(&self) -> usize { self.shared.one_done.load(Ordering::SeqCst) }

    pub fn durations(&self) -> Vec<(RunState, Duration)> { self.shared.lifecycle.lock().durations().to_vec() }

    /// Suspends until at least `n` folds have recorded a result.
    pub async fn wait_for_completed(&self, n: usize) -> Result<()> {
        let mut rx = self.shared.completed_tx.subscribe();
        rx.wait_for(|done| *done >= n).await.map_err(|_| CvError::ChannelClosed)?;
        Ok(())
    }

    /// Suspends until the run reaches `state` or any terminal state.
    pub async fn wait_for_state(&self, state: RunState) -> Result<RunState> {
        let mut rx = self.shared.state_tx.subscribe();
        let seen = rx.wait_for(|s| *s == state || s.is_terminal()).await.map_err(|_| CvError::ChannelClosed)?;
        Ok(*seen)
    }

    /// Waits for the driver. Later calls return the cached outcome.
    pub async fn await_completion(&mut self) -> Result<RunOutcome<M>> {
        if let Some(outcome) = &self.outcome { return Ok(outcome.clone()); }
        let driver = self.driver.take().ok_or_else(|| CvError::Join("run driver already failed".into()))?;
        let outcome = driver.await.map_err(|e| CvError::Join(e.to_string()))?;
        self.outcome = Some(outcome.clone());
        Ok(outcome)
    }
}
