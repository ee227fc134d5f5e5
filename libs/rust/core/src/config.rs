//! Layered node configuration: defaults, optional file (`CVFOLD_CONFIG_FILE`), then
//! environment variables prefixed `CVFOLD__` (e.g. `CVFOLD__ORCHESTRATOR__CHANNEL_CAPACITY=32`).
//!
//! Loaded values are cached for `CVFOLD_CONFIG_TTL_SECS` (default 30).

use std::path::PathBuf;
use std::time::{Duration, Instant};
use anyhow::Result;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::consistency::CheckPolicy;
use crate::fold_plan::FoldScheme;
use crate::resilience::RetryConfig;

static CONFIG_CACHE: OnceCell<RwLock<CachedConfig>> = OnceCell::new();

#[derive(Debug, Clone)]
struct CachedConfig {
    cfg: NodeConfig,
    fetched_at: Instant,
    ttl: Duration,
    file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Buffer of the fold completion channel; sub-jobs block while it is full.
    pub channel_capacity: usize,
    pub check_policy: CheckPolicy,
    /// Upper bound on concurrently running folds; unbounded when absent.
    pub max_parallel_folds: Option<usize>,
    pub deadline_ms: Option<u64>,
    /// Longest wait for room on the parent channel when posting the final `ALL_DONE`.
    pub relay_timeout_ms: u64,
    pub store_retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { channel_capacity: 16, check_policy: CheckPolicy::FailFast, max_parallel_folds: None, deadline_ms: None, relay_timeout_ms: 1000, store_retry: RetryConfig::default() }
    }
}

impl OrchestratorConfig {
    pub fn deadline(&self) -> Option<Duration> { self.deadline_ms.map(Duration::from_millis) }
    pub fn relay_timeout(&self) -> Duration { Duration::from_millis(self.relay_timeout_ms) }
}

/// Cross-validation job run by the coordinator service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub scheme: Option<FoldScheme>,
    pub total_folds: usize,
    pub fold_column: Option<String>,
    pub seed: u64,
    pub build_main_model: bool,
    pub synthetic_rows: usize,
}

impl Default for JobConfig {
    fn default() -> Self { Self { scheme: Some(FoldScheme::Auto), total_folds: 5, fold_column: None, seed: 42, build_main_model: true, synthetic_rows: 200 } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub service_name: Option<String>,
    pub log_level: Option<String>,
    pub cluster_members: usize,
    pub orchestrator: OrchestratorConfig,
    pub job: JobConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { service_name: None, log_level: Some("info".into()), cluster_members: 3, orchestrator: OrchestratorConfig::default(), job: JobConfig::default() }
    }
}

pub fn load_config(service: &str) -> Result<NodeConfig> {
    if let Some(lock) = CONFIG_CACHE.get() {
        let guard = lock.read();
        if guard.fetched_at.elapsed() < guard.ttl { return Ok(guard.cfg.clone()); }
    }
    let mut builder = config::Config::builder().set_default("service_name", service)?;
    let mut file_path: Option<PathBuf> = None;
    if let Ok(file) = std::env::var("CVFOLD_CONFIG_FILE") {
        file_path = Some(PathBuf::from(&file));
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("CVFOLD").separator("__").try_parsing(true));
    let node_cfg: NodeConfig = builder.build()?.try_deserialize()?;
    let ttl_secs: u64 = std::env::var("CVFOLD_CONFIG_TTL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30);
    let cached = CachedConfig { cfg: node_cfg.clone(), fetched_at: Instant::now(), ttl: Duration::from_secs(ttl_secs), file: file_path };
    let lock = CONFIG_CACHE.get_or_init(|| RwLock::new(cached.clone()));
    *lock.write() = cached;
    debug!(file = ?lock.read().file, "config_loaded");
    Ok(node_cfg)
}

/// Drops the cached configuration so the next `load_config` re-reads every source.
pub fn invalidate() {
    if let Some(lock) = CONFIG_CACHE.get() { lock.write().ttl = Duration::ZERO; }
}
