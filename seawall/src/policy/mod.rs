//! Policy engines
//!
//! Dedupe, cache, and rate limiting share one resolution algorithm: start
//! from the policy's global switch and method list, let the first matching
//! route rule override both, merge the rule's overrides into the policy
//! defaults, and memoize the merged result per `(METHOD, path)`. Dynamic
//! opt-out callbacks run after the memoized step and are never cached.

mod cache;
mod dedupe;
mod rate_limit;

pub(crate) use cache::{CachePolicyEngine, ResolvedCache};
pub(crate) use dedupe::DedupePolicyEngine;
pub(crate) use rate_limit::RateLimitPolicyEngine;

use http::Method;

use crate::rules::{find_matching_rule, method_allowed, PolicyRule};

/// Memoization key for rule resolution
pub(crate) fn memo_key(method: &Method, path: &str) -> String {
    format!("{} {}", method, path)
}

/// Outcome of the shared resolution steps, before config merging
pub(crate) enum RuleOutcome<'a, O> {
    /// The policy does not apply to this route
    Disabled,
    /// No rule matched; the policy applies with its defaults
    Defaults,
    /// This rule matched and is enabled for the method
    Matched(&'a PolicyRule<O>),
}

/// Shared resolution: global switch ∧ method membership, first matching
/// rule, rule-level enable/disable and method override.
pub(crate) fn resolve_outcome<'a, O>(
    global_enabled: bool,
    methods: &[Method],
    rules: &'a [PolicyRule<O>],
    method: &Method,
    path: &str,
) -> RuleOutcome<'a, O> {
    if !global_enabled && rules.is_empty() {
        return RuleOutcome::Disabled;
    }

    match find_matching_rule(rules, path) {
        Some(rule) => {
            if !rule.enabled {
                return RuleOutcome::Disabled;
            }
            let enabled = match &rule.methods {
                Some(rule_methods) => method_allowed(method, rule_methods),
                // Rule matched by path alone: it applies regardless of the
                // policy's method list
                None => true,
            };
            if enabled {
                RuleOutcome::Matched(rule)
            } else {
                RuleOutcome::Disabled
            }
        }
        None => {
            if global_enabled && method_allowed(method, methods) {
                RuleOutcome::Defaults
            } else {
                RuleOutcome::Disabled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RouteMatcher;

    fn rules() -> Vec<PolicyRule<u32>> {
        vec![
            PolicyRule::with_overrides(RouteMatcher::starts_with("/off"), 0).disabled(),
            PolicyRule::with_overrides(RouteMatcher::starts_with("/posts"), 1)
                .for_methods(vec![Method::POST]),
            PolicyRule::with_overrides(RouteMatcher::starts_with("/any"), 2),
        ]
    }

    #[test]
    fn test_globally_disabled_without_rules() {
        let outcome = resolve_outcome::<u32>(false, &[Method::GET], &[], &Method::GET, "/x");
        assert!(matches!(outcome, RuleOutcome::Disabled));
    }

    #[test]
    fn test_disabled_rule_turns_route_off() {
        let rules = rules();
        let outcome = resolve_outcome(true, &[Method::GET], &rules, &Method::GET, "/off/a");
        assert!(matches!(outcome, RuleOutcome::Disabled));
    }

    #[test]
    fn test_rule_method_filter() {
        let rules = rules();
        let outcome = resolve_outcome(true, &[Method::GET], &rules, &Method::POST, "/posts/1");
        assert!(matches!(outcome, RuleOutcome::Matched(rule) if rule.overrides == 1));

        let outcome = resolve_outcome(true, &[Method::GET], &rules, &Method::DELETE, "/posts/1");
        assert!(matches!(outcome, RuleOutcome::Disabled));
    }

    #[test]
    fn test_path_only_rule_overrides_policy_methods() {
        // POST is not in the policy's method list, but the matching rule
        // has no method filter of its own
        let rules = rules();
        let outcome = resolve_outcome(true, &[Method::GET], &rules, &Method::POST, "/any/x");
        assert!(matches!(outcome, RuleOutcome::Matched(rule) if rule.overrides == 2));
    }

    #[test]
    fn test_rules_enable_routes_even_when_globally_disabled() {
        let rules = rules();
        let outcome = resolve_outcome(false, &[Method::GET], &rules, &Method::GET, "/any/x");
        assert!(matches!(outcome, RuleOutcome::Matched(_)));

        // But unmatched routes stay off
        let outcome = resolve_outcome(false, &[Method::GET], &rules, &Method::GET, "/other");
        assert!(matches!(outcome, RuleOutcome::Disabled));
    }

    #[test]
    fn test_defaults_when_no_rule_matches() {
        let rules = rules();
        let outcome = resolve_outcome(true, &[Method::GET], &rules, &Method::GET, "/users");
        assert!(matches!(outcome, RuleOutcome::Defaults));
    }
}
