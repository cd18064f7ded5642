//! Key-value store abstraction
//!
//! Namespaced byte operations with optional TTL. The core claims inbox
//! idempotence with `set_if_absent` and caches remote documents under the
//! prefixes configured on the registry; everything else about the backing
//! store is the host's business.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

/// Ordered key path into the store
///
/// Keys are sequences of strings so backends can map them onto their own
/// namespacing (subkeys, separators, column families).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KvKey(Vec<String>);

impl KvKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Append one more component, returning the extended key
    pub fn child(&self, part: impl Into<String>) -> Self {
        let mut parts = self.0.clone();
        parts.push(part.into());
        Self(parts)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<&[&str]> for KvKey {
    fn from(parts: &[&str]) -> Self {
        Self::new(parts.iter().copied())
    }
}

/// Byte-oriented key-value store with per-entry TTL
///
/// Reads and writes may interleave with other processes sharing the store;
/// the one primitive the core depends on for correctness is
/// `set_if_absent`, which must claim a key atomically.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &KvKey, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Store `value` only when `key` is absent (or expired)
    ///
    /// # Returns
    /// `true` when this call claimed the key, `false` when it already held
    /// a live value.
    async fn set_if_absent(&self, key: &KvKey, value: &[u8], ttl: Option<Duration>)
        -> Result<bool>;

    async fn delete(&self, key: &KvKey) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_live(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

/// In-process store for tests and single-node deployments
///
/// Entries expire lazily on read; `prune_expired` reclaims memory for
/// long-running processes.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<KvKey, StoredEntry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry
    pub async fn prune_expired(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live());
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!("pruned {removed} expired key-value entries");
        }
    }
}

fn entry_for(value: &[u8], ttl: Option<Duration>) -> StoredEntry {
    StoredEntry {
        value: value.to_vec(),
        expires_at: ttl.map(|ttl| Instant::now() + ttl),
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &KvKey, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.clone(), entry_for(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &KvKey,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_live()) {
            return Ok(false);
        }
        entries.insert(key.clone(), entry_for(value, ttl));
        Ok(true)
    }

    async fn delete(&self, key: &KvKey) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }
}
