//! Single-flight deduplication policy engine

use dashmap::DashMap;
use http::Method;

use crate::config::{DedupePolicyConfig, KeySerializer};
use crate::keys::request_key;
use crate::policy::{memo_key, resolve_outcome, RuleOutcome};
use crate::response::RequestContext;

/// Merged dedupe configuration for one route
#[derive(Clone)]
pub(crate) struct ResolvedDedupe {
    pub serializer: Option<KeySerializer>,
}

pub(crate) struct DedupePolicyEngine {
    config: DedupePolicyConfig,
    memo: DashMap<String, Option<ResolvedDedupe>>,
}

impl DedupePolicyEngine {
    pub fn new(config: DedupePolicyConfig) -> Self {
        Self {
            config,
            memo: DashMap::new(),
        }
    }

    /// Memoized rule resolution for `(METHOD, path)`
    pub fn resolve(&self, method: &Method, path: &str) -> Option<ResolvedDedupe> {
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
            RuleOutcome::Defaults => Some(ResolvedDedupe {
                serializer: self.config.serializer.clone(),
            }),
            RuleOutcome::Matched(rule) => Some(ResolvedDedupe {
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
        match &self.config.should_dedupe {
            Some(predicate) => predicate(ctx),
            None => true,
        }
    }

    /// Dedupe key for a request under the resolved route config
    pub fn key(&self, resolved: &ResolvedDedupe, ctx: &RequestContext) -> String {
        match &resolved.serializer {
            Some(serializer) => serializer(ctx),
            None => request_key(&ctx.method, &ctx.url, &ctx.payload, &ctx.headers),
        }
    }

    /// Drop memoized resolutions (engine destruction)
    pub fn reset(&self) {
        self.memo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{PolicyRule, RouteMatcher};
    use std::sync::Arc;

    #[test]
    fn test_defaults_apply_to_get_only() {
        let engine = DedupePolicyEngine::new(DedupePolicyConfig::default());
        assert!(engine.resolve(&Method::GET, "/users").is_some());
        assert!(engine.resolve(&Method::POST, "/users").is_none());
    }

    #[test]
    fn test_resolution_is_memoized() {
        let engine = DedupePolicyEngine::new(DedupePolicyConfig::default());
        engine.resolve(&Method::GET, "/users");
        engine.resolve(&Method::GET, "/users");
        engine.resolve(&Method::POST, "/users");
        assert_eq!(engine.memo.len(), 2);
    }

    #[test]
    fn test_rule_serializer_wins_over_policy_serializer() {
        let policy_serializer: KeySerializer = Arc::new(|_| "policy".to_string());
        let rule_serializer: KeySerializer = Arc::new(|_| "rule".to_string());

        let config = DedupePolicyConfig::default()
            .with_serializer(policy_serializer)
            .with_rules(vec![PolicyRule::with_overrides(
                RouteMatcher::starts_with("/special"),
                crate::config::DedupeOverrides {
                    serializer: Some(rule_serializer),
                },
            )]);
        let engine = DedupePolicyEngine::new(config);

        let resolved = engine.resolve(&Method::GET, "/special/a").unwrap();
        let ctx = test_ctx();
        assert_eq!(engine.key(&resolved, &ctx), "rule");

        let resolved = engine.resolve(&Method::GET, "/plain").unwrap();
        assert_eq!(engine.key(&resolved, &ctx), "policy");
    }

    fn test_ctx() -> RequestContext {
        RequestContext {
            method: Method::GET,
            path: "/x".to_string(),
            url: url::Url::parse("https://api.example.com/x").unwrap(),
            headers: Default::default(),
            params: Default::default(),
            payload: crate::body::RequestBody::None,
            state: Default::default(),
            attempt: 1,
        }
    }
}
