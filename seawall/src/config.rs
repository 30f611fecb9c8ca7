//! Engine and per-request configuration
//!
//! Everything is programmatic: `EngineConfig` is assembled with builder
//! methods and validated by `FetchEngine::new`. Policy configuration
//! follows one shape throughout — global defaults plus per-route rules
//! carrying overrides.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::body::{BodyKind, RequestBody};
use crate::error::FetchError;
use crate::event::Listener;
use crate::props::MapValidator;
use crate::registry::CacheAdapter;
use crate::response::RequestContext;
use crate::retry::RetryConfig;
use crate::rules::PolicyRule;
use crate::transport::{Transport, TransportResponse};

/// Serializes a request snapshot into a policy key
pub type KeySerializer = Arc<dyn Fn(&RequestContext) -> String + Send + Sync>;

/// Dynamic per-request policy opt-out, evaluated after rule resolution
pub type RequestPredicate = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>;

/// Mutates per-request options during normalization
pub type ModifyOptions = Arc<dyn Fn(&mut CallOptions, &HashMap<String, Value>) + Send + Sync>;

/// Chooses how to parse a response body; `None` falls through to the
/// content-type heuristic
pub type DetermineType = Arc<dyn Fn(&TransportResponse) -> Option<BodyKind> + Send + Sync>;

/// Instance-state validation hook
pub type StateValidator =
    Arc<dyn Fn(&HashMap<String, Value>) -> std::result::Result<(), String> + Send + Sync>;

/// Per-request lifecycle callbacks
pub type OnBeforeReq = Arc<dyn Fn(&RequestContext) + Send + Sync>;
pub type OnAfterReq = Arc<dyn Fn(&RequestContext, &TransportResponse) + Send + Sync>;
pub type OnError = Arc<dyn Fn(&FetchError) + Send + Sync>;
pub type OnRateLimit = Arc<dyn Fn(&RequestContext, Duration) + Send + Sync>;

/// Header-name formatting applied at normalization time
#[derive(Clone, Default)]
pub enum HeaderFormat {
    /// Keep names exactly as stored
    #[default]
    Preserve,
    Lowercase,
    Uppercase,
    /// Caller-supplied formatter
    Custom(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl HeaderFormat {
    pub fn apply(&self, name: &str) -> String {
        match self {
            Self::Preserve => name.to_string(),
            Self::Lowercase => name.to_ascii_lowercase(),
            Self::Uppercase => name.to_ascii_uppercase(),
            Self::Custom(formatter) => formatter(name),
        }
    }
}

/// Validation hooks for engine mutations and per-request checks
#[derive(Clone, Default)]
pub struct ValidateHooks {
    /// Runs against header maps on every header mutation
    pub headers: Option<MapValidator>,
    /// Runs against param maps on every param mutation
    pub params: Option<MapValidator>,
    /// Runs against the state map on `set_state`
    pub state: Option<StateValidator>,
    /// Also validate the merged headers of every request
    pub per_request_headers: bool,
    /// Also validate the merged params of every request
    pub per_request_params: bool,
}

/// Dedupe rule overrides
#[derive(Clone, Default)]
pub struct DedupeOverrides {
    pub serializer: Option<KeySerializer>,
}

/// Single-flight deduplication policy
#[derive(Clone)]
pub struct DedupePolicyConfig {
    pub enabled: bool,
    pub methods: Vec<Method>,
    pub rules: Vec<PolicyRule<DedupeOverrides>>,
    pub serializer: Option<KeySerializer>,
    /// Dynamic opt-out; returning `false` skips dedupe for that request
    pub should_dedupe: Option<RequestPredicate>,
}

impl Default for DedupePolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: vec![Method::GET],
            rules: Vec::new(),
            serializer: None,
            should_dedupe: None,
        }
    }
}

impl DedupePolicyConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_rules(mut self, rules: Vec<PolicyRule<DedupeOverrides>>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_serializer(mut self, serializer: KeySerializer) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn with_should_dedupe(mut self, predicate: RequestPredicate) -> Self {
        self.should_dedupe = Some(predicate);
        self
    }
}

/// Cache rule overrides
#[derive(Clone, Default)]
pub struct CacheOverrides {
    pub ttl: Option<Duration>,
    pub stale_in: Option<Duration>,
    pub serializer: Option<KeySerializer>,
}

/// Response-cache policy with TTL and stale-while-revalidate
#[derive(Clone)]
pub struct CachePolicyConfig {
    pub enabled: bool,
    /// Entry lifetime
    pub ttl: Duration,
    /// Stale threshold within the TTL; `None` disables SWR
    pub stale_in: Option<Duration>,
    pub methods: Vec<Method>,
    pub rules: Vec<PolicyRule<CacheOverrides>>,
    pub serializer: Option<KeySerializer>,
    /// Dynamic opt-out; returning `true` skips the cache for that request
    pub skip: Option<RequestPredicate>,
    /// Storage backend; in-memory when `None`
    pub adapter: Option<Arc<dyn CacheAdapter>>,
}

impl Default for CachePolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(60),
            stale_in: None,
            methods: vec![Method::GET],
            rules: Vec::new(),
            serializer: None,
            skip: None,
            adapter: None,
        }
    }
}

impl CachePolicyConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_stale_in(mut self, stale_in: Duration) -> Self {
        self.stale_in = Some(stale_in);
        self
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_rules(mut self, rules: Vec<PolicyRule<CacheOverrides>>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_serializer(mut self, serializer: KeySerializer) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn with_skip(mut self, predicate: RequestPredicate) -> Self {
        self.skip = Some(predicate);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn CacheAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }
}

/// Rate-limit rule overrides
#[derive(Clone, Default)]
pub struct RateLimitOverrides {
    pub max_calls: Option<u32>,
    pub window: Option<Duration>,
    pub wait_for_token: Option<bool>,
    pub serializer: Option<KeySerializer>,
}

/// Token-bucket rate-limit policy
#[derive(Clone)]
pub struct RateLimitPolicyConfig {
    pub enabled: bool,
    /// Calls allowed per window
    pub max_calls: u32,
    /// Refill window
    pub window: Duration,
    /// Wait for a token instead of failing immediately
    pub wait_for_token: bool,
    pub methods: Vec<Method>,
    pub rules: Vec<PolicyRule<RateLimitOverrides>>,
    pub serializer: Option<KeySerializer>,
    /// Dynamic opt-out; returning `false` skips the limiter
    pub should_rate_limit: Option<RequestPredicate>,
    /// Invoked when a request starts waiting for a token
    pub on_rate_limit: Option<OnRateLimit>,
}

impl Default for RateLimitPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_calls: 100,
            window: Duration::from_secs(60),
            wait_for_token: true,
            methods: vec![
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::PATCH,
                Method::OPTIONS,
            ],
            rules: Vec::new(),
            serializer: None,
            should_rate_limit: None,
            on_rate_limit: None,
        }
    }
}

impl RateLimitPolicyConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_max_calls(mut self, max_calls: u32) -> Self {
        self.max_calls = max_calls;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_wait_for_token(mut self, wait: bool) -> Self {
        self.wait_for_token = wait;
        self
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_rules(mut self, rules: Vec<PolicyRule<RateLimitOverrides>>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_serializer(mut self, serializer: KeySerializer) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn with_should_rate_limit(mut self, predicate: RequestPredicate) -> Self {
        self.should_rate_limit = Some(predicate);
        self
    }

    pub fn with_on_rate_limit(mut self, callback: OnRateLimit) -> Self {
        self.on_rate_limit = Some(callback);
        self
    }
}

/// Engine-level configuration
#[derive(Clone)]
pub struct EngineConfig {
    /// Absolute base URL every relative path is composed onto
    pub base_url: String,
    /// Response kind used when a response carries no `Content-Type`
    pub default_type: BodyKind,
    pub headers: HashMap<String, String>,
    pub method_headers: HashMap<Method, HashMap<String, String>>,
    pub params: HashMap<String, String>,
    pub method_params: HashMap<Method, HashMap<String, String>>,
    /// Instance-level total timeout (highest-precedence value wins, see
    /// `FetchEngine`)
    pub total_timeout: Option<Duration>,
    /// Legacy alias for the total timeout, lower precedence
    pub timeout: Option<Duration>,
    /// Per-attempt timeout
    pub attempt_timeout: Option<Duration>,
    pub retry: RetryConfig,
    pub validate: ValidateHooks,
    pub modify_options: Option<ModifyOptions>,
    pub modify_method_options: HashMap<Method, ModifyOptions>,
    pub determine_type: Option<DetermineType>,
    pub header_format: HeaderFormat,
    pub dedupe: DedupePolicyConfig,
    pub cache: CachePolicyConfig,
    pub rate_limit: RateLimitPolicyConfig,
    /// Transport override; `reqwest` when `None`
    pub transport: Option<Arc<dyn Transport>>,
    /// Instance name carried in tracing fields
    pub name: Option<String>,
    /// Listener observing every event
    pub spy: Option<Listener>,
}

impl EngineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_type: BodyKind::Json,
            headers: HashMap::new(),
            method_headers: HashMap::new(),
            params: HashMap::new(),
            method_params: HashMap::new(),
            total_timeout: None,
            timeout: None,
            attempt_timeout: None,
            retry: RetryConfig::default(),
            validate: ValidateHooks::default(),
            modify_options: None,
            modify_method_options: HashMap::new(),
            determine_type: None,
            header_format: HeaderFormat::default(),
            dedupe: DedupePolicyConfig::default(),
            cache: CachePolicyConfig::default(),
            rate_limit: RateLimitPolicyConfig::default(),
            transport: None,
            name: None,
            spy: None,
        }
    }

    pub fn with_default_type(mut self, kind: BodyKind) -> Self {
        self.default_type = kind;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_method_header(
        mut self,
        method: Method,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.method_headers
            .entry(method)
            .or_default()
            .insert(name.into(), value.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_method_param(
        mut self,
        method: Method,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.method_params
            .entry(method)
            .or_default()
            .insert(name.into(), value.into());
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_validate(mut self, validate: ValidateHooks) -> Self {
        self.validate = validate;
        self
    }

    pub fn with_modify_options(mut self, hook: ModifyOptions) -> Self {
        self.modify_options = Some(hook);
        self
    }

    pub fn with_modify_method_options(mut self, method: Method, hook: ModifyOptions) -> Self {
        self.modify_method_options.insert(method, hook);
        self
    }

    pub fn with_determine_type(mut self, hook: DetermineType) -> Self {
        self.determine_type = Some(hook);
        self
    }

    pub fn with_header_format(mut self, format: HeaderFormat) -> Self {
        self.header_format = format;
        self
    }

    pub fn with_dedupe(mut self, dedupe: DedupePolicyConfig) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub fn with_cache(mut self, cache: CachePolicyConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitPolicyConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_spy(mut self, spy: Listener) -> Self {
        self.spy = Some(spy);
        self
    }
}

/// Per-request options
#[derive(Clone, Default)]
pub struct CallOptions {
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub payload: RequestBody,
    /// Highest-precedence total timeout for this request
    pub total_timeout: Option<Duration>,
    /// Legacy alias, lower precedence than `total_timeout`
    pub timeout: Option<Duration>,
    pub attempt_timeout: Option<Duration>,
    /// External token linked into the request's abort scope
    pub cancel_token: Option<CancellationToken>,
    /// Retry override for this request
    pub retry: Option<RetryConfig>,
    pub determine_type: Option<DetermineType>,
    pub on_before_req: Option<OnBeforeReq>,
    pub on_after_req: Option<OnAfterReq>,
    pub on_error: Option<OnError>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<RequestBody>) -> Self {
        self.payload = payload.into();
        self
    }

    /// JSON payload shorthand
    pub fn with_json(mut self, value: Value) -> Self {
        self.payload = RequestBody::Json(value);
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_determine_type(mut self, hook: DetermineType) -> Self {
        self.determine_type = Some(hook);
        self
    }

    pub fn on_before_req(mut self, callback: OnBeforeReq) -> Self {
        self.on_before_req = Some(callback);
        self
    }

    pub fn on_after_req(mut self, callback: OnAfterReq) -> Self {
        self.on_after_req = Some(callback);
        self
    }

    pub fn on_error(mut self, callback: OnError) -> Self {
        self.on_error = Some(callback);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let config = EngineConfig::new("https://api.example.com")
            .with_header("Accept", "application/json")
            .with_method_header(Method::POST, "X-Kind", "write")
            .with_total_timeout(Duration::from_secs(5))
            .with_cache(
                CachePolicyConfig::enabled()
                    .with_ttl(Duration::from_secs(30))
                    .with_stale_in(Duration::from_secs(10)),
            );

        assert_eq!(config.headers["Accept"], "application/json");
        assert_eq!(config.method_headers[&Method::POST]["X-Kind"], "write");
        assert!(config.cache.enabled);
        assert_eq!(config.cache.ttl, Duration::from_secs(30));
        assert_eq!(config.cache.stale_in, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_policy_defaults() {
        let dedupe = DedupePolicyConfig::default();
        assert!(dedupe.enabled);
        assert_eq!(dedupe.methods, vec![Method::GET]);

        let cache = CachePolicyConfig::default();
        assert!(!cache.enabled);
        assert_eq!(cache.ttl, Duration::from_secs(60));
        assert!(cache.stale_in.is_none());

        let rate_limit = RateLimitPolicyConfig::default();
        assert!(!rate_limit.enabled);
        assert!(rate_limit.wait_for_token);
        assert_eq!(rate_limit.methods.len(), 6);
    }

    #[test]
    fn test_header_format() {
        assert_eq!(HeaderFormat::Preserve.apply("X-Token"), "X-Token");
        assert_eq!(HeaderFormat::Lowercase.apply("X-Token"), "x-token");
        assert_eq!(HeaderFormat::Uppercase.apply("X-Token"), "X-TOKEN");
        let custom = HeaderFormat::Custom(Arc::new(|name: &str| format!("app-{}", name)));
        assert_eq!(custom.apply("id"), "app-id");
    }
}
