//! Per-route policy rule matching
//!
//! Policies (dedupe, cache, rate limit) are configured per route through
//! rules. A rule matches a path either exactly or through an AND-group of
//! partial matchers (prefix, suffix, substring, regex), optionally
//! restricted to a set of methods. The first matching rule wins.

use http::Method;
use regex::Regex;

/// Path matcher for a rule
///
/// `Exact` is mutually exclusive with the partial group; within the group
/// every present condition must hold.
#[derive(Debug, Clone)]
pub enum RouteMatcher {
    /// Exact path match
    Exact(String),
    /// AND-group of partial conditions
    Parts(MatchParts),
}

/// Partial path conditions, combined with AND
///
/// An empty group matches every path (catch-all rule).
#[derive(Debug, Clone, Default)]
pub struct MatchParts {
    /// Path must start with this prefix
    pub starts_with: Option<String>,
    /// Path must end with this suffix
    pub ends_with: Option<String>,
    /// Path must contain this substring
    pub includes: Option<String>,
    /// Path must match this regex
    pub pattern: Option<Regex>,
}

impl RouteMatcher {
    /// Exact path rule
    pub fn exact(path: impl Into<String>) -> Self {
        Self::Exact(path.into())
    }

    /// Prefix rule
    pub fn starts_with(prefix: impl Into<String>) -> Self {
        Self::Parts(MatchParts {
            starts_with: Some(prefix.into()),
            ..MatchParts::default()
        })
    }

    /// Suffix rule
    pub fn ends_with(suffix: impl Into<String>) -> Self {
        Self::Parts(MatchParts {
            ends_with: Some(suffix.into()),
            ..MatchParts::default()
        })
    }

    /// Substring rule
    pub fn includes(fragment: impl Into<String>) -> Self {
        Self::Parts(MatchParts {
            includes: Some(fragment.into()),
            ..MatchParts::default()
        })
    }

    /// Regex rule
    pub fn pattern(regex: Regex) -> Self {
        Self::Parts(MatchParts {
            pattern: Some(regex),
            ..MatchParts::default()
        })
    }

    /// Whether this matcher accepts the given path
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == path,
            Self::Parts(parts) => {
                if let Some(prefix) = &parts.starts_with {
                    if !path.starts_with(prefix.as_str()) {
                        return false;
                    }
                }
                if let Some(suffix) = &parts.ends_with {
                    if !path.ends_with(suffix.as_str()) {
                        return false;
                    }
                }
                if let Some(fragment) = &parts.includes {
                    if !path.contains(fragment.as_str()) {
                        return false;
                    }
                }
                if let Some(regex) = &parts.pattern {
                    if !regex.is_match(path) {
                        return false;
                    }
                }
                true
            }
        }
    }
}

/// A route rule carrying policy-specific overrides
#[derive(Debug, Clone)]
pub struct PolicyRule<T> {
    /// How the rule selects paths
    pub matcher: RouteMatcher,
    /// Methods the rule applies to; `None` inherits the policy's methods
    pub methods: Option<Vec<Method>>,
    /// `false` disables the policy entirely for matching routes
    pub enabled: bool,
    /// Policy-specific overrides applied when the rule matches
    pub overrides: T,
}

impl<T: Default> PolicyRule<T> {
    /// Rule with default overrides
    pub fn new(matcher: RouteMatcher) -> Self {
        Self {
            matcher,
            methods: None,
            enabled: true,
            overrides: T::default(),
        }
    }
}

impl<T> PolicyRule<T> {
    /// Rule with explicit overrides
    pub fn with_overrides(matcher: RouteMatcher, overrides: T) -> Self {
        Self {
            matcher,
            methods: None,
            enabled: true,
            overrides,
        }
    }

    /// Restrict the rule to specific methods
    pub fn for_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = Some(methods);
        self
    }

    /// Disable the policy for routes this rule matches
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Case-insensitive method membership
pub fn method_allowed(method: &Method, methods: &[Method]) -> bool {
    methods
        .iter()
        .any(|m| m.as_str().eq_ignore_ascii_case(method.as_str()))
}

/// First matching rule for a path, if any
pub fn find_matching_rule<'a, T>(
    rules: &'a [PolicyRule<T>],
    path: &str,
) -> Option<&'a PolicyRule<T>> {
    rules.iter().find(|rule| rule.matcher.matches(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let matcher = RouteMatcher::exact("/api/users");
        assert!(matcher.matches("/api/users"));
        assert!(!matcher.matches("/api/users/1"));
    }

    #[test]
    fn test_partial_matchers() {
        assert!(RouteMatcher::starts_with("/api").matches("/api/users"));
        assert!(!RouteMatcher::starts_with("/api").matches("/v2/api"));
        assert!(RouteMatcher::ends_with(".json").matches("/export.json"));
        assert!(RouteMatcher::includes("admin").matches("/api/admin/users"));
        assert!(RouteMatcher::pattern(Regex::new(r"^/users/\d+$").unwrap()).matches("/users/42"));
    }

    #[test]
    fn test_and_group_requires_all_conditions() {
        let matcher = RouteMatcher::Parts(MatchParts {
            starts_with: Some("/api".to_string()),
            ends_with: Some("/export".to_string()),
            ..MatchParts::default()
        });
        assert!(matcher.matches("/api/reports/export"));
        assert!(!matcher.matches("/api/reports"));
        assert!(!matcher.matches("/internal/export"));
    }

    #[test]
    fn test_empty_group_is_catch_all() {
        let matcher = RouteMatcher::Parts(MatchParts::default());
        assert!(matcher.matches("/anything"));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules: Vec<PolicyRule<u32>> = vec![
            PolicyRule::with_overrides(RouteMatcher::starts_with("/api/admin"), 1),
            PolicyRule::with_overrides(RouteMatcher::starts_with("/api"), 2),
        ];
        assert_eq!(
            find_matching_rule(&rules, "/api/admin/users").unwrap().overrides,
            1
        );
        assert_eq!(find_matching_rule(&rules, "/api/users").unwrap().overrides, 2);
        assert!(find_matching_rule(&rules, "/health").is_none());
    }

    #[test]
    fn test_method_allowed_is_case_insensitive() {
        let methods = vec![Method::GET, Method::POST];
        assert!(method_allowed(&Method::GET, &methods));
        assert!(method_allowed(
            &Method::from_bytes(b"get").unwrap_or(Method::GET),
            &methods
        ));
        assert!(!method_allowed(&Method::DELETE, &methods));
    }
}
