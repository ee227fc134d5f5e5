use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use futures::future::join_all;
use futures::FutureExt;
use opentelemetry::KeyValue;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use crate::config::OrchestratorConfig;
use crate::consistency::ConsistencyChecker;
use crate::error::{CvError, Result};
use crate::events::{EventChannel, EventReceiver, EventSender, OverflowPolicy, TrainingEvent};
use crate::fold_plan::FoldPlan;
use crate::frame::Frame;
use crate::lifecycle::{ModelLifecycleId, RunState};
use crate::metrics::CV_METRICS;
use crate::resilience::retry_async;
use crate::store::{put_json, Store, StoreKey};
use crate::transform::{DataTransformStage, TransformContext, TransformPipeline};
use super::handle::RunShared;
use super::holdout::HoldoutPredictionCombiner;
use super::listener::{notify_failure, notify_success, panic_message};
use super::{BuildHandle, BuildListener, CrossValidatedModel, FitRequest, ModelBuildingResult, ModelFitter, Parameters, RunOutcome};

/// Store key of a fold sub-model (`Some(fold)`) or of the main model (`None`).
pub fn model_key(lifecycle_id: &ModelLifecycleId, fold: Option<usize>) -> StoreKey {
    match fold {
        Some(f) => StoreKey::new(format!("cv/{lifecycle_id}/fold-{f}/model")),
        None => StoreKey::new(format!("cv/{lifecycle_id}/main/model")),
    }
}

pub struct FoldOrchestrator<F: ModelFitter> {
    fitter: Arc<F>,
    pipeline: Arc<TransformPipeline>,
    store: Arc<dyn Store>,
    listener: Arc<dyn BuildListener<F::Model>>,
    config: OrchestratorConfig,
    parent: Option<EventSender>,
}

impl<F: ModelFitter> FoldOrchestrator<F> {
    pub fn new(fitter: Arc<F>, pipeline: Arc<TransformPipeline>, store: Arc<dyn Store>, listener: Arc<dyn BuildListener<F::Model>>) -> Self {
        Self { fitter, pipeline, store, listener, config: OrchestratorConfig::default(), parent: None }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self { self.config = config; self }

    /// Relay every fold's `ONE_DONE` and the run's final `ALL_DONE` to an enclosing job.
    pub fn with_parent_events(mut self, parent: EventSender) -> Self { self.parent = Some(parent); self }

    pub fn config(&self) -> &OrchestratorConfig { &self.config }

    /// Plans the run and dispatches it on the current Tokio runtime.
    ///
    /// Configuration problems (fold assignment, fold count vs rows, missing columns) are
    /// returned here, before any sub-job exists.
    #[instrument(skip_all, fields(model = %params.model_id))]
    pub fn start(&self, params: Parameters, train: Frame) -> Result<BuildHandle<F::Model>> {
        let mode = params.fold_assignment.validate()?;
        if let Some(response) = &params.response_column {
            if train.column(response).is_none() {
                return Err(CvError::Configuration(format!("response column `{response}` not in training frame")));
            }
        }
        let plan = FoldPlan::compute(&train, &mode, params.response_column.as_deref(), params.seed)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CvError::Configuration("start() must be called from within a Tokio runtime".into()))?;

        let total_folds = plan.total_folds();
        let lifecycle_id = ModelLifecycleId::mint();
        let shared = Arc::new(RunShared::new());
        let cancel = CancellationToken::new();
        info!(lifecycle = %lifecycle_id, folds = total_folds, rows = train.nrows(), sizes = ?plan.fold_sizes(), cv_sensitive = self.pipeline.is_cv_sensitive(), "cv_run_planned");

        let run = Arc::new(Run {
            fitter: self.fitter.clone(),
            pipeline: self.pipeline.clone(),
            store: self.store.clone(),
            listener: self.listener.clone(),
            config: self.config.clone(),
            parent: self.parent.clone(),
            params: Arc::new(params),
            train: Arc::new(train),
            plan: Arc::new(plan),
            lifecycle_id: lifecycle_id.clone(),
            shared: shared.clone(),
            cancel: cancel.clone(),
        });
        let driver = runtime.spawn(run.drive());
        Ok(BuildHandle::new(lifecycle_id, total_folds, shared, cancel, driver))
    }
}

/// Everything one run needs, shared by the driver and its sub-jobs.
struct Run<F: ModelFitter> {
    fitter: Arc<F>,
    pipeline: Arc<TransformPipeline>,
    store: Arc<dyn Store>,
    listener: Arc<dyn BuildListener<F::Model>>,
    config: OrchestratorConfig,
    parent: Option<EventSender>,
    params: Arc<Parameters>,
    train: Arc<Frame>,
    plan: Arc<FoldPlan>,
    lifecycle_id: ModelLifecycleId,
    shared: Arc<RunShared<F::Model>>,
    cancel: CancellationToken,
}

enum Wait { AllReported, Cancelled, DeadlineExceeded, Disconnected }

impl<F: ModelFitter> Run<F> {
    async fn drive(self: Arc<Self>) -> RunOutcome<F::Model> {
        let started = Instant::now();
        let outcome = match self.clone().execute().await {
            RunOutcome::Succeeded(model) => {
                self.shared.advance(RunState::Succeeded);
                notify_success(self.listener.as_ref(), &model);
                RunOutcome::Succeeded(model)
            }
            RunOutcome::Failed(cause) => {
                self.shared.advance(RunState::Failed);
                notify_failure(self.listener.as_ref(), &self.lifecycle_id, &cause, &self.params);
                RunOutcome::Failed(cause)
            }
            RunOutcome::Cancelled => {
                self.shared.advance(RunState::Cancelled);
                RunOutcome::Cancelled
            }
        };
        if let Some(parent) = &self.parent {
            // the run is already terminal; a parent that stopped draining must not hold the driver
            match tokio::time::timeout(self.config.relay_timeout(), parent.on_all_iterations_complete()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(lifecycle = %self.lifecycle_id, error = %e, "parent ALL_DONE not delivered"),
                Err(_) => warn!(lifecycle = %self.lifecycle_id, timeout_ms = self.config.relay_timeout_ms, "parent ALL_DONE timed out"),
            }
        }
        let state = outcome.state();
        CV_METRICS.runs_total.add(1, &[KeyValue::new("outcome", state.as_str())]);
        match &outcome {
            RunOutcome::Failed(cause) => warn!(lifecycle = %self.lifecycle_id, outcome = state.as_str(), elapsed_ms = started.elapsed().as_millis() as u64, %cause, "cv_run_finished"),
            _ => info!(lifecycle = %self.lifecycle_id, outcome = state.as_str(), elapsed_ms = started.elapsed().as_millis() as u64, "cv_run_finished"),
        }
        outcome
    }

    async fn execute(self: Arc<Self>) -> RunOutcome<F::Model> {
        if self.cancel.is_cancelled() { return RunOutcome::Cancelled; }

        // The main model's training frame is transformed up front under the non-CV
        // context. Without a CV-sensitive transformer every fold would compute the same
        // statistics, so folds are then split from that frame instead of transforming their own.
        let cv_sensitive = self.pipeline.is_cv_sensitive();
        let main_train = if self.params.build_main_model || !cv_sensitive {
            let ctx = TransformContext::new(self.lifecycle_id.clone());
            match self.pipeline.transform((*self.train).clone(), DataTransformStage::Training, Some(&ctx)).await {
                Ok(frame) => Some(Arc::new(frame)),
                Err(e) => return RunOutcome::Failed(Arc::new(e)),
            }
        } else {
            None
        };
        if self.cancel.is_cancelled() { return RunOutcome::Cancelled; }
        let base = if cv_sensitive { None } else { main_train.clone() };

        let total = self.plan.total_folds();
        let (tx, mut rx) = EventChannel::bounded(self.config.channel_capacity, OverflowPolicy::Block);
        let permits = self.config.max_parallel_folds.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let mut jobs: Vec<JoinHandle<()>> = Vec::with_capacity(total);
        for fold in 0..total {
            let run = self.clone();
            let (tx, permits, base) = (tx.clone(), permits.clone(), base.clone());
            jobs.push(tokio::spawn(async move { run.sub_job(fold, base, permits, tx).await }));
            self.shared.mark_dispatched();
            CV_METRICS.folds_dispatched_total.add(1, &[]);
            if fold == 0 { self.shared.advance(RunState::Running); }
        }
        drop(tx);

        let wait = self.await_folds(&mut rx, total).await;
        // Sub-jobs still blocked on a full channel see it closed and exit.
        drop(rx);
        if !matches!(wait, Wait::AllReported) { self.cancel.cancel(); }
        join_all(jobs).await;

        match wait {
            Wait::AllReported => {}
            Wait::Cancelled => return RunOutcome::Cancelled,
            Wait::DeadlineExceeded => {
                let deadline = self.config.deadline().unwrap_or_default();
                return RunOutcome::Failed(Arc::new(CvError::DeadlineExceeded(deadline)));
            }
            Wait::Disconnected => return RunOutcome::Failed(Arc::new(CvError::ChannelClosed)),
        }

        self.shared.advance(RunState::Aggregating);
        if let Some((fold, cause)) = self.shared.first_failure() {
            debug!(lifecycle = %self.lifecycle_id, fold, "fold_failure_selected_as_cause");
            return RunOutcome::Failed(cause);
        }

        let main_model = match main_train.as_deref().filter(|_| self.params.build_main_model) {
            Some(train) => match self.build_main(train).await {
                Ok(model) => Some(model),
                Err(CvError::Cancelled) => return RunOutcome::Cancelled,
                Err(e) => return RunOutcome::Failed(Arc::new(e)),
            },
            None => None,
        };

        let holdout_predictions = if self.params.keep_cross_validation_predictions {
            let per_fold = self.shared.predictions();
            if per_fold.is_empty() {
                None
            } else {
                let combiner = HoldoutPredictionCombiner::new(self.params.holdout_predictions_precision);
                match combiner.combine(&self.plan, &per_fold) {
                    Ok(combined) => Some(combined),
                    Err(e) => return RunOutcome::Failed(Arc::new(e)),
                }
            }
        } else {
            None
        };

        let mut keys = self.shared.mutated();
        keys.extend(self.pipeline.allocated_keys(&self.lifecycle_id));
        keys.sort();
        keys.dedup();
        let checker = ConsistencyChecker::new(self.store.clone(), self.config.check_policy).with_retry(self.config.store_retry.clone());
        if let Err(e) = checker.check_all(&keys).await {
            return RunOutcome::Failed(Arc::new(e));
        }
        if self.cancel.is_cancelled() { return RunOutcome::Cancelled; }

        let model = CrossValidatedModel {
            lifecycle_id: self.lifecycle_id.clone(),
            params: (*self.params).clone(),
            fold_results: self.shared.results(),
            main_model,
            holdout_predictions,
        };
        if !self.params.keep_cross_validation_models {
            if let Err(e) = model.delete_cross_validation_models(self.store.as_ref(), &self.config.store_retry).await {
                warn!(lifecycle = %self.lifecycle_id, error = %e, "cv sub-models not deleted");
            }
        }
        RunOutcome::Succeeded(Arc::new(model))
    }

    /// Counts `ONE_DONE`s until every fold reported, the run is cancelled or the deadline passes.
    async fn await_folds(&self, rx: &mut EventReceiver, total: usize) -> Wait {
        let deadline = self.config.deadline();
        let expiry = async move {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);
        let mut observed = 0;
        while observed < total {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Wait::Cancelled,
                _ = &mut expiry => return self.deadline_exceeded(observed, total),
                event = rx.recv() => event,
            };
            match event {
                Some(TrainingEvent::OneDone) => {
                    observed += 1;
                    self.shared.mark_one_done();
                    let Some(parent) = &self.parent else { continue };
                    // a parent that stops draining must not shield the run from cancel or deadline
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Wait::Cancelled,
                        _ = &mut expiry => return self.deadline_exceeded(observed, total),
                        sent = parent.on_iteration_complete() => {
                            if let Err(e) = sent {
                                warn!(lifecycle = %self.lifecycle_id, error = %e, "parent ONE_DONE not delivered");
                            }
                        }
                    }
                }
                Some(TrainingEvent::AllDone) => {}
                None => return Wait::Disconnected,
            }
        }
        Wait::AllReported
    }

    fn deadline_exceeded(&self, observed: usize, total: usize) -> Wait {
        warn!(lifecycle = %self.lifecycle_id, observed, total, "cv run deadline exceeded");
        Wait::DeadlineExceeded
    }

    async fn sub_job(self: Arc<Self>, fold: usize, base: Option<Arc<Frame>>, permits: Option<Arc<Semaphore>>, tx: EventSender) {
        let _permit = match permits {
            Some(sem) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                permit = sem.acquire_owned() => match permit {
                    Ok(p) => Some(p),
                    Err(_) => return,
                },
            },
            None => None,
        };
        let started = Instant::now();
        let params = self.params.for_fold(fold, self.plan.total_folds());
        let built = AssertUnwindSafe(self.build_fold(fold, &params, base.as_deref())).catch_unwind().await;
        let result = match built {
            Ok(Ok(model)) => {
                CV_METRICS.folds_succeeded_total.add(1, &[]);
                debug!(lifecycle = %self.lifecycle_id, fold, "fold_built");
                ModelBuildingResult::success(model, params, Some(fold))
            }
            Ok(Err(CvError::Cancelled)) => {
                CV_METRICS.folds_cancelled_total.add(1, &[]);
                debug!(lifecycle = %self.lifecycle_id, fold, "fold_cancelled");
                return;
            }
            Ok(Err(e)) => {
                CV_METRICS.folds_failed_total.add(1, &[]);
                warn!(lifecycle = %self.lifecycle_id, fold, error = %e, "fold_failed");
                ModelBuildingResult::failure(Arc::new(e), params, Some(fold))
            }
            Err(panic) => {
                CV_METRICS.folds_failed_total.add(1, &[]);
                let msg = panic_message(&panic);
                warn!(lifecycle = %self.lifecycle_id, fold, panic = %msg, "fold_panicked");
                let cause = CvError::fold_build(fold, anyhow::anyhow!("fit panicked: {msg}"));
                ModelBuildingResult::failure(Arc::new(cause), params, Some(fold))
            }
        };
        CV_METRICS.fold_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        self.shared.record(fold, result);
        if let Err(e) = tx.on_iteration_complete().await {
            debug!(lifecycle = %self.lifecycle_id, fold, error = %e, "ONE_DONE not delivered");
        }
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() { Err(CvError::Cancelled) } else { Ok(()) }
    }

    async fn build_fold(&self, fold: usize, params: &Parameters, base: Option<&Frame>) -> Result<F::Model> {
        let ctx = TransformContext::for_fold(self.lifecycle_id.clone(), &self.params.fold_assignment, fold, self.plan.total_folds());
        self.checkpoint()?;
        let (train, holdout) = match base {
            Some(frame) => self.plan.split(frame, fold),
            None => {
                let (train, holdout) = self.plan.split(&self.train, fold);
                let train = self.pipeline.transform(train, DataTransformStage::Training, Some(&ctx)).await?;
                self.checkpoint()?;
                let holdout = self.pipeline.transform(holdout, DataTransformStage::Validation, Some(&ctx)).await?;
                (train, holdout)
            }
        };
        self.checkpoint()?;
        let req = FitRequest { train: &train, holdout: Some(&holdout), params, ctx: &ctx };
        let model = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CvError::Cancelled),
            fitted = self.fitter.fit(req) => fitted.map_err(|e| CvError::fold_build(fold, e))?,
        };
        self.checkpoint()?;
        if self.params.keep_cross_validation_predictions {
            if let Some(preds) = self.fitter.predict_holdout(&model, &holdout) {
                if preds.len() != holdout.nrows() {
                    return Err(CvError::fold_build(fold, anyhow::anyhow!("{} holdout predictions for {} holdout rows", preds.len(), holdout.nrows())));
                }
                self.shared.record_predictions(fold, preds);
            }
        }
        self.persist(model_key(&self.lifecycle_id, Some(fold)), &model).await?;
        Ok(model)
    }

    /// Fits the final model on the full frame transformed before the folds ran.
    async fn build_main(&self, train: &Frame) -> Result<F::Model> {
        let ctx = TransformContext::new(self.lifecycle_id.clone());
        self.checkpoint()?;
        let req = FitRequest { train, holdout: None, params: &self.params, ctx: &ctx };
        let model = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CvError::Cancelled),
            fitted = self.fitter.fit(req) => fitted.map_err(|e| CvError::MainBuild(e.into()))?,
        };
        self.persist(model_key(&self.lifecycle_id, None), &model).await?;
        info!(lifecycle = %self.lifecycle_id, rows = train.nrows(), "main_model_built");
        Ok(model)
    }

    async fn persist(&self, key: StoreKey, model: &F::Model) -> Result<()> {
        retry_async(&self.config.store_retry, "model_put", |_| put_json(self.store.as_ref(), &key, model)).await?;
        self.shared.mark_mutated(key);
        Ok(())
    }
}
