//! Error taxonomy for fold orchestration, transform pipelines and consistency checks.

use thiserror::Error;
use crate::store::{MemberId, StoreKey};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CvError {
    /// Invalid fold assignment or parameters; raised by `start()` before any dispatch.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transformer `{transformer}` has no training state for lifecycle {lifecycle_id}{}", fold_suffix(.fold))]
    MissingTransformState { transformer: String, lifecycle_id: String, fold: Option<usize> },

    #[error("fold {fold} failed to build: {source}")]
    FoldBuild { fold: usize, #[source] source: BoxError },

    #[error("main model failed to build: {0}")]
    MainBuild(#[source] BoxError),

    /// Divergent copies of a shared value. Never retried.
    #[error("key {key} is inconsistent on member(s) {}", join_members(.members))]
    InconsistentState { key: StoreKey, members: Vec<MemberId> },

    #[error("event channel full (capacity {capacity})")]
    ChannelOverflow { capacity: usize },

    #[error("event channel closed")]
    ChannelClosed,

    #[error("run cancelled")]
    Cancelled,

    #[error("run exceeded its deadline of {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("orchestrator task failed: {0}")]
    Join(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CvError {
    /// Only backend failures are transient; everything else signals a caller or program bug.
    pub fn is_retryable(&self) -> bool { matches!(self, CvError::Store(_)) }

    /// First offending member of an inconsistency report.
    pub fn offending_member(&self) -> Option<MemberId> {
        match self { CvError::InconsistentState { members, .. } => members.first().copied(), _ => None }
    }

    pub fn fold_build(fold: usize, err: anyhow::Error) -> Self { CvError::FoldBuild { fold, source: err.into() } }
}

fn fold_suffix(fold: &Option<usize>) -> String {
    fold.map(|f| format!(" (fold {f})")).unwrap_or_default()
}

fn join_members(members: &[MemberId]) -> String {
    members.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ")
}

pub type Result<T, E = CvError> = std::result::Result<T, E>;
