/// Consistency audits over many keys and members.
/// Run with: cargo test --test consistency_cluster

use std::sync::Arc;
use cvfold_core::*;

async fn cluster_with(keys: &[&str], size: usize) -> Arc<InMemoryCluster> {
    let cluster = InMemoryCluster::new(size);
    for k in keys {
        let key = StoreKey::new(*k);
        cluster.put(&key, k.as_bytes().to_vec()).await.unwrap();
        cluster.replicate_everywhere(&key);
    }
    cluster
}

#[tokio::test]
async fn audit_stops_at_first_inconsistent_key() {
    let cluster = cluster_with(&["a", "b", "c"], 4).await;
    let bad = cluster.member_ids()[3];
    cluster.corrupt(bad, &StoreKey::new("b"), b"stale".to_vec());
    let keys: Vec<StoreKey> = cluster.keys();
    let err = ConsistencyChecker::new(cluster.clone(), CheckPolicy::FailFast).check_all(&keys).await.unwrap_err();
    match err {
        CvError::InconsistentState { key, members } => {
            assert_eq!(key.as_str(), "b");
            assert_eq!(members, vec![bad]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn reconciled_copy_passes_again() {
    let cluster = cluster_with(&["model"], 3).await;
    let key = StoreKey::new("model");
    let m = cluster.member_ids()[0];
    cluster.edit_locally(m, &key, b"local".to_vec());
    let checker = ConsistencyChecker::new(cluster.clone(), CheckPolicy::CollectAll);
    assert!(checker.check(&key).await.is_err());
    // writing through the store refreshes every cached copy
    cluster.put(&key, b"model-v2".to_vec()).await.unwrap();
    checker.check(&key).await.unwrap();
}

#[tokio::test]
async fn removed_key_has_nothing_to_diverge() {
    let cluster = cluster_with(&["tmp"], 2).await;
    let key = StoreKey::new("tmp");
    cluster.remove(&key).await.unwrap();
    ConsistencyChecker::new(cluster, CheckPolicy::FailFast).check(&key).await.unwrap();
}

#[tokio::test]
async fn persistent_store_outage_surfaces_after_retries() {
    let cluster = cluster_with(&["k"], 2).await;
    cluster.fail_next(10);
    let checker = ConsistencyChecker::new(cluster, CheckPolicy::FailFast)
        .with_retry(RetryConfig { max_retries: 2, base_delay_ms: 1, max_delay_ms: 2, jitter: 0.0 });
    let err = checker.check(&StoreKey::new("k")).await.unwrap_err();
    assert!(err.is_retryable());
}
