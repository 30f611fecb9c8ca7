//! Response-cache policy engine
//!
//! Owns the route resolution plus the cache-specific state bags: the set
//! of keys this engine has written (`active`) and the set currently being
//! revalidated in the background (`revalidating`, the SWR stampede guard).

use std::time::Duration;

use dashmap::DashMap;
use http::Method;

use crate::config::{CachePolicyConfig, KeySerializer};
use crate::keys::request_key;
use crate::policy::{memo_key, resolve_outcome, RuleOutcome};
use crate::response::RequestContext;

/// Merged cache configuration for one route
#[derive(Clone)]
pub(crate) struct ResolvedCache {
    pub ttl: Duration,
    pub stale_in: Option<Duration>,
    pub serializer: Option<KeySerializer>,
}

pub(crate) struct CachePolicyEngine {
    config: CachePolicyConfig,
    memo: DashMap<String, Option<ResolvedCache>>,
    active: DashMap<String, ()>,
    revalidating: DashMap<String, ()>,
}

impl CachePolicyEngine {
    pub fn new(config: CachePolicyConfig) -> Self {
        Self {
            config,
            memo: DashMap::new(),
            active: DashMap::new(),
            revalidating: DashMap::new(),
        }
    }

    /// Memoized rule resolution for `(METHOD, path)`
    pub fn resolve(&self, method: &Method, path: &str) -> Option<ResolvedCache> {
        let key = memo_key(method, path);
        if let Some(hit) = self.memo.get(&key) {
            return hit.clone();
        }

        let resolved = match resolve_outcome(
            self.config.enabled,
            &self.config.methods,
            &self.config.rules,
            method,
            path,
        ) {
            RuleOutcome::Disabled => None,
            RuleOutcome::Defaults => Some(ResolvedCache {
                ttl: self.config.ttl,
                stale_in: self.config.stale_in,
                serializer: self.config.serializer.clone(),
            }),
            RuleOutcome::Matched(rule) => Some(ResolvedCache {
                ttl: rule.overrides.ttl.unwrap_or(self.config.ttl),
                stale_in: rule.overrides.stale_in.or(self.config.stale_in),
                serializer: rule
                    .overrides
                    .serializer
                    .clone()
                    .or_else(|| self.config.serializer.clone()),
            }),
        };

        self.memo.insert(key, resolved.clone());
        resolved
    }

    /// Dynamic opt-out: `true` means skip the cache for this request
    pub fn skips(&self, ctx: &RequestContext) -> bool {
        match &self.config.skip {
            Some(predicate) => predicate(ctx),
            None => false,
        }
    }

    /// Cache key for a request under the resolved route config
    pub fn key(&self, resolved: &ResolvedCache, ctx: &RequestContext) -> String {
        match &resolved.serializer {
            Some(serializer) => serializer(ctx),
            None => request_key(&ctx.method, &ctx.url, &ctx.payload, &ctx.headers),
        }
    }

    /// Claim the revalidation slot for a key. Returns `false` when a
    /// revalidation is already in flight (the caller must not start
    /// another one).
    pub fn begin_revalidation(&self, key: &str) -> bool {
        self.revalidating.insert(key.to_string(), ()).is_none()
    }

    /// Release the revalidation slot
    pub fn end_revalidation(&self, key: &str) {
        self.revalidating.remove(key);
    }

    /// Record that this engine wrote a key
    pub fn mark_active(&self, key: &str) {
        self.active.insert(key.to_string(), ());
    }

    /// Forget a written key
    pub fn unmark_active(&self, key: &str) {
        self.active.remove(key);
    }

    /// Forget every written key (`clear_cache`)
    pub fn reset_active(&self) {
        self.active.clear();
    }

    /// Drop all policy state (engine destruction)
    pub fn reset(&self) {
        self.memo.clear();
        self.active.clear();
        self.revalidating.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheOverrides;
    use crate::rules::{PolicyRule, RouteMatcher};

    #[test]
    fn test_disabled_by_default() {
        let engine = CachePolicyEngine::new(CachePolicyConfig::default());
        assert!(engine.resolve(&Method::GET, "/users").is_none());
    }

    #[test]
    fn test_rule_overrides_ttl_and_stale() {
        let config = CachePolicyConfig::enabled()
            .with_ttl(Duration::from_secs(60))
            .with_rules(vec![PolicyRule::with_overrides(
                RouteMatcher::starts_with("/fast"),
                CacheOverrides {
                    ttl: Some(Duration::from_millis(200)),
                    stale_in: Some(Duration::from_millis(50)),
                    serializer: None,
                },
            )]);
        let engine = CachePolicyEngine::new(config);

        let resolved = engine.resolve(&Method::GET, "/fast/x").unwrap();
        assert_eq!(resolved.ttl, Duration::from_millis(200));
        assert_eq!(resolved.stale_in, Some(Duration::from_millis(50)));

        let resolved = engine.resolve(&Method::GET, "/users").unwrap();
        assert_eq!(resolved.ttl, Duration::from_secs(60));
        assert_eq!(resolved.stale_in, None);
    }

    #[test]
    fn test_revalidation_slot_is_exclusive() {
        let engine = CachePolicyEngine::new(CachePolicyConfig::enabled());
        assert!(engine.begin_revalidation("k"));
        assert!(!engine.begin_revalidation("k"));
        engine.end_revalidation("k");
        assert!(engine.begin_revalidation("k"));
    }
}
