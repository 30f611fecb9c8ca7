//! Single-flight and cache registry
//!
//! Two maps keyed by canonical request key: the in-flight map collapses
//! concurrent identical requests onto one shared outcome, and the cache
//! map holds TTL'd responses behind a pluggable adapter. The default
//! adapter is in-memory; a remote adapter implements [`CacheAdapter`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::time::Instant;

use crate::error::FetchError;
use crate::response::FetchResponse;

/// Outcome shared between a single-flight leader and its joiners
pub type Outcome = Result<FetchResponse, FetchError>;

/// Cloneable handle to a leader's eventual outcome
pub type SharedOutcome = Shared<BoxFuture<'static, Outcome>>;

/// One cached response with its freshness window
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached response
    pub value: FetchResponse,
    /// When the entry was written
    pub inserted_at: Instant,
    /// From this point the entry is stale (served, but revalidated)
    pub stale_at: Instant,
    /// From this point the entry is gone
    pub expires_at: Instant,
}

impl CacheEntry {
    /// Build an entry; `stale_in` defaults to the full TTL (never stale
    /// before expiry) and is clamped into the TTL window.
    pub fn new(value: FetchResponse, ttl: Duration, stale_in: Option<Duration>) -> Self {
        let inserted_at = Instant::now();
        let expires_at = inserted_at + ttl;
        let stale_at = match stale_in {
            Some(stale_in) => (inserted_at + stale_in.min(ttl)).min(expires_at),
            None => expires_at,
        };
        Self {
            value,
            inserted_at,
            stale_at,
            expires_at,
        }
    }

    /// Fresh: before the stale threshold
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.stale_at
    }

    /// Stale: past the threshold but not yet expired
    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.stale_at && now < self.expires_at
    }

    /// Expired: treated as a miss
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Pluggable cache backend
///
/// All operations are async so remote adapters can await I/O. Expired
/// entries may be evicted lazily on `get`; `entries` must not return
/// expired entries. Adapters that persist across processes are
/// responsible for re-anchoring entry deadlines on load.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    async fn set(&self, key: &str, entry: CacheEntry);
    async fn delete(&self, key: &str) -> bool;
    async fn clear(&self);
    async fn has(&self, key: &str) -> bool;
    async fn size(&self) -> usize;
    async fn entries(&self) -> Vec<(String, CacheEntry)>;
}

/// Default in-memory adapter backed by `DashMap`, evicting lazily on
/// access
#[derive(Default)]
pub struct InMemoryAdapter {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheAdapter for InMemoryAdapter {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(Instant::now()) {
                return Some(entry.clone());
            }
            drop(entry);
            self.entries.remove(key);
        }
        None
    }

    async fn set(&self, key: &str, entry: CacheEntry) {
        self.entries.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    async fn clear(&self) {
        self.entries.clear();
    }

    async fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    async fn size(&self) -> usize {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        self.entries.len()
    }

    async fn entries(&self) -> Vec<(String, CacheEntry)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

struct InflightEntry {
    shared: SharedOutcome,
    joiners: Arc<AtomicUsize>,
}

/// Result of an atomic join-or-start on the in-flight map
pub enum InflightJoin {
    /// No prior in-flight request for the key; the caller is the leader
    Started(SharedOutcome),
    /// Joined an existing leader; `waiting` counts joiners so far
    Joined {
        shared: SharedOutcome,
        waiting: usize,
    },
}

/// Registry stats exposed through the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live (non-expired) cache entries
    pub cache_size: usize,
    /// Requests currently in flight as dedupe leaders
    pub inflight_count: usize,
}

/// Shared single-flight + cache state, owned by the engine
pub struct Registry {
    inflight: DashMap<String, InflightEntry>,
    adapter: Arc<dyn CacheAdapter>,
}

impl Registry {
    pub fn new(adapter: Arc<dyn CacheAdapter>) -> Self {
        Self {
            inflight: DashMap::new(),
            adapter,
        }
    }

    /// Peek at an in-flight outcome without joining it
    pub fn get_inflight(&self, key: &str) -> Option<SharedOutcome> {
        self.inflight.get(key).map(|entry| entry.shared.clone())
    }

    /// Atomically join an existing in-flight request or register a new
    /// leader. The leader future is registered before this returns, so no
    /// two concurrent callers can both start a transport call for one key.
    pub fn join_or_track(
        &self,
        key: &str,
        make: impl FnOnce() -> BoxFuture<'static, Outcome>,
    ) -> InflightJoin {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                let inflight = entry.get();
                let waiting = inflight.joiners.fetch_add(1, Ordering::SeqCst) + 1;
                InflightJoin::Joined {
                    shared: inflight.shared.clone(),
                    waiting,
                }
            }
            Entry::Vacant(slot) => {
                let shared = make().shared();
                slot.insert(InflightEntry {
                    shared: shared.clone(),
                    joiners: Arc::new(AtomicUsize::new(0)),
                });
                InflightJoin::Started(shared)
            }
        }
    }

    /// Remove a settled leader from the in-flight map
    pub fn remove_inflight(&self, key: &str) {
        self.inflight.remove(key);
    }

    /// Number of in-flight leaders
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Cache lookup (expired entries are misses)
    pub async fn get_cache(&self, key: &str) -> Option<CacheEntry> {
        self.adapter.get(key).await
    }

    /// Cache write with TTL and optional stale window
    pub async fn set_cache(
        &self,
        key: &str,
        value: FetchResponse,
        ttl: Duration,
        stale_in: Option<Duration>,
    ) {
        self.adapter
            .set(key, CacheEntry::new(value, ttl, stale_in))
            .await;
    }

    pub async fn delete_cache(&self, key: &str) -> bool {
        self.adapter.delete(key).await
    }

    pub async fn clear_cache(&self) {
        self.adapter.clear().await;
    }

    pub async fn cache_entries(&self) -> Vec<(String, CacheEntry)> {
        self.adapter.entries().await
    }

    /// Drop all in-flight tracking (engine destruction)
    pub fn clear_inflight(&self) {
        self.inflight.clear();
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            cache_size: self.adapter.size().await,
            inflight_count: self.inflight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ResponseBody;
    use crate::response::RequestContext;
    use http::Method;
    use std::collections::HashMap;

    fn response(status: u16) -> FetchResponse {
        FetchResponse {
            data: ResponseBody::Empty,
            headers: HashMap::new(),
            status,
            request: RequestContext {
                method: Method::GET,
                path: "/t".to_string(),
                url: url::Url::parse("https://api.example.com/t").unwrap(),
                headers: HashMap::new(),
                params: HashMap::new(),
                payload: crate::body::RequestBody::None,
                state: HashMap::new(),
                attempt: 1,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_entry_freshness_windows() {
        let entry = CacheEntry::new(
            response(200),
            Duration::from_millis(200),
            Some(Duration::from_millis(50)),
        );
        let t0 = entry.inserted_at;

        assert!(entry.is_fresh(t0 + Duration::from_millis(49)));
        assert!(entry.is_stale(t0 + Duration::from_millis(50)));
        assert!(entry.is_stale(t0 + Duration::from_millis(199)));
        assert!(entry.is_expired(t0 + Duration::from_millis(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_defaults_to_ttl() {
        let entry = CacheEntry::new(response(200), Duration::from_millis(100), None);
        let t0 = entry.inserted_at;
        assert!(entry.is_fresh(t0 + Duration::from_millis(99)));
        assert!(!entry.is_stale(t0 + Duration::from_millis(99)));
        assert!(entry.is_expired(t0 + Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_adapter_expires_entries() {
        let registry = Registry::new(Arc::new(InMemoryAdapter::new()));
        registry
            .set_cache("k", response(200), Duration::from_millis(100), None)
            .await;
        assert!(registry.get_cache("k").await.is_some());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(registry.get_cache("k").await.is_none());
        assert_eq!(registry.stats().await.cache_size, 0);
    }

    #[tokio::test]
    async fn test_join_or_track_single_leader() {
        let registry = Registry::new(Arc::new(InMemoryAdapter::new()));

        let first = registry.join_or_track("k", || async { Ok(response(200)) }.boxed());
        assert!(matches!(first, InflightJoin::Started(_)));

        let second = registry.join_or_track("k", || unreachable!("leader already registered"));
        match second {
            InflightJoin::Joined { waiting, .. } => assert_eq!(waiting, 1),
            InflightJoin::Started(_) => panic!("expected join"),
        }

        let third = registry.join_or_track("k", || unreachable!());
        match third {
            InflightJoin::Joined { waiting, shared } => {
                assert_eq!(waiting, 2);
                let out = shared.await.unwrap();
                assert_eq!(out.status, 200);
            }
            InflightJoin::Started(_) => panic!("expected join"),
        }

        registry.remove_inflight("k");
        assert_eq!(registry.inflight_count(), 0);
    }
}
