//! Metric groups for fold orchestration, event channel and consistency checks.
//!
//! Instruments come from the global meter; they record nothing until the embedding
//! service installs a meter provider.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub struct CvMetrics {
    pub folds_dispatched_total: Counter<u64>,
    pub folds_succeeded_total: Counter<u64>,
    pub folds_failed_total: Counter<u64>,
    pub folds_cancelled_total: Counter<u64>,
    pub runs_total: Counter<u64>,
    pub fold_latency_ms: Histogram<f64>,
    pub events_enqueued_total: Counter<u64>,
    pub events_rejected_total: Counter<u64>,
    pub consistency_checks_total: Counter<u64>,
    pub inconsistencies_total: Counter<u64>,
    pub store_retries_total: Counter<u64>,
}

static CV_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("cvfold"));

pub static CV_METRICS: Lazy<CvMetrics> = Lazy::new(|| {
    CvMetrics {
        folds_dispatched_total: CV_METER.u64_counter("cvfold_folds_dispatched_total").with_description("Fold sub-jobs dispatched").build(),
        folds_succeeded_total: CV_METER.u64_counter("cvfold_folds_succeeded_total").with_description("Fold sub-jobs that produced a model").build(),
        folds_failed_total: CV_METER.u64_counter("cvfold_folds_failed_total").with_description("Fold sub-jobs that recorded a failure").build(),
        folds_cancelled_total: CV_METER.u64_counter("cvfold_folds_cancelled_total").with_description("Fold sub-jobs stopped at a cancellation checkpoint").build(),
        runs_total: CV_METER.u64_counter("cvfold_runs_total").with_description("Orchestrator runs by terminal outcome").build(),
        fold_latency_ms: CV_METER.f64_histogram("cvfold_fold_latency_ms").with_description("Wall time of one fold sub-job (ms)").with_unit("ms").build(),
        events_enqueued_total: CV_METER.u64_counter("cvfold_events_enqueued_total").with_description("Training events enqueued").build(),
        events_rejected_total: CV_METER.u64_counter("cvfold_events_rejected_total").with_description("Training events rejected by a full reject-on-full channel").build(),
        consistency_checks_total: CV_METER.u64_counter("cvfold_consistency_checks_total").with_description("Keys verified by the consistency checker").build(),
        inconsistencies_total: CV_METER.u64_counter("cvfold_inconsistencies_total").with_description("Member copies found diverging from the authoritative value").build(),
        store_retries_total: CV_METER.u64_counter("cvfold_store_retries_total").with_description("Store operations retried after a transient failure").build(),
    }
});
