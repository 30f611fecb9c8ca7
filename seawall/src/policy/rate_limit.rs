//! Token-bucket rate-limit policy engine
//!
//! One bucket per resolved key (by default, per `METHOD|path` endpoint).
//! Buckets are created on first use with the route's resolved capacity
//! and window.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use http::Method;

use crate::bucket::TokenBucket;
use crate::config::{KeySerializer, OnRateLimit, RateLimitPolicyConfig};
use crate::keys::rate_limit_key;
use crate::policy::{memo_key, resolve_outcome, RuleOutcome};
use crate::response::RequestContext;

/// Merged rate-limit configuration for one route
#[derive(Clone)]
pub(crate) struct ResolvedRateLimit {
    pub max_calls: u32,
    pub window: Duration,
    pub wait_for_token: bool,
    pub serializer: Option<KeySerializer>,
}

pub(crate) struct RateLimitPolicyEngine {
    config: RateLimitPolicyConfig,
    memo: DashMap<String, Option<ResolvedRateLimit>>,
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl RateLimitPolicyEngine {
    pub fn new(config: RateLimitPolicyConfig) -> Self {
        Self {
            config,
            memo: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    /// Memoized rule resolution for `(METHOD, path)`
    pub fn resolve(&self, method: &Method, path: &str) -> Option<ResolvedRateLimit> {
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
            RuleOutcome::Defaults => Some(ResolvedRateLimit {
                max_calls: self.config.max_calls,
                window: self.config.window,
                wait_for_token: self.config.wait_for_token,
                serializer: self.config.serializer.clone(),
            }),
            RuleOutcome::Matched(rule) => Some(ResolvedRateLimit {
                max_calls: rule.overrides.max_calls.unwrap_or(self.config.max_calls),
                window: rule.overrides.window.unwrap_or(self.config.window),
                wait_for_token: rule
                    .overrides
                    .wait_for_token
                    .unwrap_or(self.config.wait_for_token),
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

    /// Dynamic opt-out, evaluated per request and never cached
    pub fn applies_to(&self, ctx: &RequestContext) -> bool {
        match &self.config.should_rate_limit {
            Some(predicate) => predicate(ctx),
            None => true,
        }
    }

    /// Bucket key for a request under the resolved route config
    pub fn key(&self, resolved: &ResolvedRateLimit, ctx: &RequestContext) -> String {
        match &resolved.serializer {
            Some(serializer) => serializer(ctx),
            None => rate_limit_key(&ctx.method, &ctx.url),
        }
    }

    /// Get or create the bucket for a key
    pub fn bucket_for(&self, key: &str, resolved: &ResolvedRateLimit) -> Arc<TokenBucket> {
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(resolved.max_calls, resolved.window)))
            .clone()
    }

    pub fn on_rate_limit(&self) -> Option<&OnRateLimit> {
        self.config.on_rate_limit.as_ref()
    }

    /// Drop memoized resolutions and all buckets (engine destruction)
    pub fn reset(&self) {
        self.memo.clear();
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitOverrides;
    use crate::rules::{PolicyRule, RouteMatcher};

    #[test]
    fn test_disabled_by_default() {
        let engine = RateLimitPolicyEngine::new(RateLimitPolicyConfig::default());
        assert!(engine.resolve(&Method::GET, "/r").is_none());
    }

    #[test]
    fn test_rule_overrides_capacity_and_wait() {
        let config = RateLimitPolicyConfig::enabled()
            .with_max_calls(100)
            .with_rules(vec![PolicyRule::with_overrides(
                RouteMatcher::exact("/expensive"),
                RateLimitOverrides {
                    max_calls: Some(2),
                    window: Some(Duration::from_secs(1)),
                    wait_for_token: Some(false),
                    serializer: None,
                },
            )]);
        let engine = RateLimitPolicyEngine::new(config);

        let resolved = engine.resolve(&Method::GET, "/expensive").unwrap();
        assert_eq!(resolved.max_calls, 2);
        assert!(!resolved.wait_for_token);

        let resolved = engine.resolve(&Method::GET, "/cheap").unwrap();
        assert_eq!(resolved.max_calls, 100);
        assert!(resolved.wait_for_token);
    }

    #[tokio::test]
    async fn test_one_bucket_per_key() {
        let engine = RateLimitPolicyEngine::new(RateLimitPolicyConfig::enabled());
        let resolved = engine.resolve(&Method::GET, "/r").unwrap();

        let a = engine.bucket_for("GET|/r", &resolved);
        let b = engine.bucket_for("GET|/r", &resolved);
        let c = engine.bucket_for("GET|/other", &resolved);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
