//! Shared distributed key/value store capability.
//!
//! The authoritative copy of every value lives in the store; cluster members may hold
//! locally cached copies which are either in sync or carry unflushed local edits.
//! `InMemoryCluster` is the in-process implementation used by the coordinator service
//! and tests.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use crate::error::{CvError, Result};

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MemberId(Uuid);

impl MemberId {
    pub fn generate() -> Self { Self(Uuid::new_v4()) }
    pub fn from_uuid(u: Uuid) -> Self { Self(u) }
    pub fn as_uuid(&self) -> Uuid { self.0 }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn new(k: impl Into<String>) -> Self { Self(k.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl Display for StoreKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// A member's cached copy of a shared value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalCopy {
    pub bytes: Vec<u8>,
    /// False while the member holds local edits not yet reconciled with the authoritative copy.
    pub consistent: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &StoreKey, bytes: Vec<u8>) -> Result<()>;
    async fn remove(&self, key: &StoreKey) -> Result<()>;
    /// Members that hold, or may hold, cached copies.
    async fn members(&self) -> Result<Vec<MemberId>>;
    /// Runs "on" `member`: its cached copy of `key`, if any.
    async fn local_copy(&self, member: MemberId, key: &StoreKey) -> Result<Option<LocalCopy>>;

    async fn local_copy_is_consistent(&self, member: MemberId, key: &StoreKey) -> Result<bool> {
        Ok(self.local_copy(member, key).await?.map(|c| c.consistent).unwrap_or(true))
    }
}

/// Serialize `value` as JSON and store it under `key`.
pub async fn put_json<T: Serialize + Sync>(store: &dyn Store, key: &StoreKey, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, bytes).await
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(store: &dyn Store, key: &StoreKey) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// In-process cluster: an authoritative map plus one cache per member.
///
/// Every `put` is written through to the key's home member (chosen by key hash) and to
/// any member already caching the key.
pub struct InMemoryCluster {
    members: Vec<MemberId>,
    authoritative: RwLock<HashMap<StoreKey, Vec<u8>>>,
    caches: HashMap<MemberId, RwLock<HashMap<StoreKey, LocalCopy>>>,
    unavailable: RwLock<u32>,
}

impl InMemoryCluster {
    pub fn new(size: usize) -> Arc<Self> {
        let members: Vec<MemberId> = (0..size.max(1)).map(|_| MemberId::generate()).collect();
        let caches = members.iter().map(|m| (*m, RwLock::new(HashMap::new()))).collect();
        Arc::new(Self { members, authoritative: RwLock::new(HashMap::new()), caches, unavailable: RwLock::new(0) })
    }

    pub fn member_ids(&self) -> &[MemberId] { &self.members }

    pub fn home_member(&self, key: &StoreKey) -> MemberId {
        let h = key.as_str().bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        self.members[(h % self.members.len() as u64) as usize]
    }

    /// Cache the current authoritative value on `member`.
    pub fn replicate(&self, key: &StoreKey, member: MemberId) {
        let Some(bytes) = self.authoritative.read().get(key).cloned() else { return };
        if let Some(cache) = self.caches.get(&member) {
            cache.write().insert(key.clone(), LocalCopy { bytes, consistent: true });
        }
    }

    pub fn replicate_everywhere(&self, key: &StoreKey) {
        for m in &self.members { self.replicate(key, *m); }
    }

    /// A local edit on `member` that has not been flushed back to the store.
    pub fn edit_locally(&self, member: MemberId, key: &StoreKey, bytes: Vec<u8>) {
        if let Some(cache) = self.caches.get(&member) {
            cache.write().insert(key.clone(), LocalCopy { bytes, consistent: false });
        }
    }

    /// Silent divergence: the member believes its copy is in sync but the bytes differ.
    pub fn corrupt(&self, member: MemberId, key: &StoreKey, bytes: Vec<u8>) {
        if let Some(cache) = self.caches.get(&member) {
            cache.write().insert(key.clone(), LocalCopy { bytes, consistent: true });
        }
    }

    /// Make the next `n` store operations fail with a transient error.
    pub fn fail_next(&self, n: u32) { *self.unavailable.write() = n; }

    pub fn keys(&self) -> Vec<StoreKey> {
        let mut keys: Vec<StoreKey> = self.authoritative.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn guard(&self) -> Result<()> {
        let mut left = self.unavailable.write();
        if *left > 0 {
            *left -= 1;
            return Err(CvError::Store("member unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryCluster {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        self.guard()?;
        Ok(self.authoritative.read().get(key).cloned())
    }

    async fn put(&self, key: &StoreKey, bytes: Vec<u8>) -> Result<()> {
        self.guard()?;
        self.authoritative.write().insert(key.clone(), bytes.clone());
        let home = self.home_member(key);
        for (member, cache) in &self.caches {
            let mut c = cache.write();
            if *member == home || c.contains_key(key) {
                c.insert(key.clone(), LocalCopy { bytes: bytes.clone(), consistent: true });
            }
        }
        debug!(%key, %home, "store_put");
        Ok(())
    }

    async fn remove(&self, key: &StoreKey) -> Result<()> {
        self.guard()?;
        self.authoritative.write().remove(key);
        for cache in self.caches.values() { cache.write().remove(key); }
        Ok(())
    }

    async fn members(&self) -> Result<Vec<MemberId>> { Ok(self.members.clone()) }

    async fn local_copy(&self, member: MemberId, key: &StoreKey) -> Result<Option<LocalCopy>> {
        Ok(self.caches.get(&member).and_then(|c| c.read().get(key).cloned()))
    }
}
