//! Scatter/gather verification that cached copies of a shared value match the
//! authoritative copy.
//!
//! `check(key)` snapshots the authoritative bytes once, then runs one verification task
//! per cluster member in parallel. A member without a copy passes. A member whose copy
//! carries unflushed local edits, or whose bytes differ from the snapshot, fails the
//! check. Inconsistency is a program bug in concurrent mutation and is never retried.
//!
//! Two gather policies:
//! - `FailFast`: the first failing member aborts the outstanding member tasks.
//! - `CollectAll`: every member is checked and all offenders are reported.

use std::sync::Arc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};
use crate::error::{CvError, Result};
use crate::metrics::CV_METRICS;
use crate::resilience::{retry_async, RetryConfig};
use crate::store::{MemberId, Store, StoreKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckPolicy {
    #[default]
    FailFast,
    CollectAll,
}

/// Key plus the authoritative bytes captured when the check was requested.
#[derive(Debug, Clone)]
pub struct ConsistencyRecord {
    pub key: StoreKey,
    pub snapshot: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict { NoCopy, Consistent, Inconsistent }

pub struct ConsistencyChecker {
    store: Arc<dyn Store>,
    policy: CheckPolicy,
    retry: RetryConfig,
}

impl ConsistencyChecker {
    pub fn new(store: Arc<dyn Store>, policy: CheckPolicy) -> Self { Self { store, policy, retry: RetryConfig::default() } }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self { self.retry = retry; self }

    pub fn policy(&self) -> CheckPolicy { self.policy }

    #[instrument(skip(self), fields(policy = ?self.policy))]
    pub async fn check(&self, key: &StoreKey) -> Result<()> {
        let snapshot = retry_async(&self.retry, "consistency_snapshot", |_| self.store.get(key)).await?;
        let record = Arc::new(ConsistencyRecord { key: key.clone(), snapshot });
        let members = retry_async(&self.retry, "consistency_members", |_| self.store.members()).await?;
        CV_METRICS.consistency_checks_total.add(1, &[]);
        let res = match self.policy {
            CheckPolicy::FailFast => self.gather_fail_fast(&record, &members).await,
            CheckPolicy::CollectAll => self.gather_all(&record, &members).await,
        };
        if let Err(CvError::InconsistentState { members: bad, .. }) = &res {
            CV_METRICS.inconsistencies_total.add(bad.len() as u64, &[]);
            warn!(%key, offenders = bad.len(), first = %bad[0], "shared value diverged from authoritative copy");
        } else if res.is_ok() {
            debug!(%key, members = members.len(), "consistency_ok");
        }
        res
    }

    /// Checks keys one after another; stops at the first inconsistent key.
    pub async fn check_all(&self, keys: &[StoreKey]) -> Result<()> {
        for key in keys { self.check(key).await?; }
        Ok(())
    }

    fn spawn_member(&self, record: &Arc<ConsistencyRecord>, member: MemberId) -> impl std::future::Future<Output = (MemberId, Result<Verdict>)> + Send + 'static {
        let store = self.store.clone();
        let record = record.clone();
        let retry = self.retry.clone();
        async move {
            let copy = retry_async(&retry, "consistency_local_copy", |_| store.local_copy(member, &record.key)).await;
            let verdict = copy.map(|c| match c {
                None => Verdict::NoCopy,
                Some(c) if !c.consistent => Verdict::Inconsistent,
                Some(c) if record.snapshot.as_deref() != Some(c.bytes.as_slice()) => Verdict::Inconsistent,
                Some(_) => Verdict::Consistent,
            });
            (member, verdict)
        }
    }

    async fn gather_fail_fast(&self, record: &Arc<ConsistencyRecord>, members: &[MemberId]) -> Result<()> {
        let mut set = JoinSet::new();
        for m in members { set.spawn(self.spawn_member(record, *m)); }
        while let Some(joined) = set.join_next().await {
            let (member, verdict) = joined.map_err(|e| CvError::Store(format!("member verification task failed: {e}")))?;
            match verdict {
                Ok(Verdict::Inconsistent) => {
                    set.abort_all();
                    return Err(CvError::InconsistentState { key: record.key.clone(), members: vec![member] });
                }
                Ok(_) => {}
                Err(e) => {
                    set.abort_all();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn gather_all(&self, record: &Arc<ConsistencyRecord>, members: &[MemberId]) -> Result<()> {
        let tasks: Vec<_> = members.iter().map(|m| tokio::spawn(self.spawn_member(record, *m))).collect();
        let mut offenders = Vec::new();
        let mut first_err = None;
        // join_all keeps member order
        for joined in join_all(tasks).await {
            match joined {
                Ok((member, Ok(Verdict::Inconsistent))) => offenders.push(member),
                Ok((_, Ok(_))) => {}
                Ok((_, Err(e))) => { first_err.get_or_insert(e); }
                Err(e) => { first_err.get_or_insert(CvError::Store(format!("member verification task failed: {e}"))); }
            }
        }
        if !offenders.is_empty() {
            return Err(CvError::InconsistentState { key: record.key.clone(), members: offenders });
        }
        match first_err { Some(e) => Err(e), None => Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCluster;

    async fn seeded(size: usize) -> (Arc<InMemoryCluster>, StoreKey) {
        let cluster = InMemoryCluster::new(size);
        let key = StoreKey::new("shared/model");
        cluster.put(&key, b"weights-v1".to_vec()).await.unwrap();
        cluster.replicate_everywhere(&key);
        (cluster, key)
    }

    #[tokio::test]
    async fn identical_copies_pass() {
        let (cluster, key) = seeded(4).await;
        for policy in [CheckPolicy::FailFast, CheckPolicy::CollectAll] {
            ConsistencyChecker::new(cluster.clone(), policy).check(&key).await.unwrap();
        }
    }

    #[tokio::test]
    async fn members_without_copy_are_skipped() {
        let cluster = InMemoryCluster::new(5);
        let key = StoreKey::new("k");
        cluster.put(&key, vec![7]).await.unwrap();
        ConsistencyChecker::new(cluster, CheckPolicy::FailFast).check(&key).await.unwrap();
    }

    #[tokio::test]
    async fn names_the_single_diverging_member() {
        let (cluster, key) = seeded(4).await;
        let bad = cluster.member_ids()[2];
        cluster.corrupt(bad, &key, b"weights-v2".to_vec());
        for policy in [CheckPolicy::FailFast, CheckPolicy::CollectAll] {
            let err = ConsistencyChecker::new(cluster.clone(), policy).check(&key).await.unwrap_err();
            match err {
                CvError::InconsistentState { key: k, members } => {
                    assert_eq!(k, key);
                    assert_eq!(members, vec![bad]);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unflushed_local_edit_fails() {
        let (cluster, key) = seeded(3).await;
        let m = cluster.member_ids()[0];
        // same bytes, but the member still flags a pending local edit
        cluster.edit_locally(m, &key, b"weights-v1".to_vec());
        let err = ConsistencyChecker::new(cluster.clone(), CheckPolicy::FailFast).check(&key).await.unwrap_err();
        assert_eq!(err.offending_member(), Some(m));
    }

    #[tokio::test]
    async fn collect_all_reports_every_offender() {
        let (cluster, key) = seeded(5).await;
        let ids = cluster.member_ids().to_vec();
        cluster.corrupt(ids[1], &key, b"x".to_vec());
        cluster.edit_locally(ids[3], &key, b"y".to_vec());
        let err = ConsistencyChecker::new(cluster.clone(), CheckPolicy::CollectAll).check(&key).await.unwrap_err();
        match err {
            CvError::InconsistentState { members, .. } => assert_eq!(members, vec![ids[1], ids[3]]),
            other => panic!("unexpected {other:?}"),
        }
        let err = ConsistencyChecker::new(cluster, CheckPolicy::FailFast).check(&key).await.unwrap_err();
        let first = err.offending_member().unwrap();
        assert!(first == ids[1] || first == ids[3]);
    }

    #[tokio::test]
    async fn transient_snapshot_failure_is_retried() {
        let (cluster, key) = seeded(2).await;
        cluster.fail_next(1);
        let checker = ConsistencyChecker::new(cluster, CheckPolicy::FailFast)
            .with_retry(RetryConfig { max_retries: 2, base_delay_ms: 1, max_delay_ms: 2, jitter: 0.0 });
        checker.check(&key).await.unwrap();
    }
}
