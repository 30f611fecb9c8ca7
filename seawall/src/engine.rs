//! The request engine
//!
//! `FetchEngine` orchestrates the whole pipeline: validate → normalize →
//! rate-limit guard → cache lookup → single-flight join-or-start →
//! attempt loop → cache write → settle. It owns the property stores, the
//! policy engines, the single-flight/cache registry, the event bus, and
//! the root cancellation token every request scope descends from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::FutureExt;
use http::Method;
use regex::Regex;
use serde_json::Value;
use tokio::time::Instant;
use url::Url;

use crate::abort::{AbortHandle, AbortScope, Abortable};
use crate::body::{kind_for_content_type, parse_body, BodyKind};
use crate::config::{
    CallOptions, DetermineType, EngineConfig, HeaderFormat, ModifyOptions, OnAfterReq, OnBeforeReq,
    ValidateHooks,
};
use crate::error::{ErrorContext, FetchError, FetchStep, Result};
use crate::event::{EventBus, EventFilter, EventKind, FetchEvent, Listener, ListenerId};
use crate::keys::path_from_key;
use crate::policy::{CachePolicyEngine, DedupePolicyEngine, RateLimitPolicyEngine, ResolvedCache};
use crate::props::PropertyStore;
use crate::registry::{CacheEntry, InMemoryAdapter, InflightJoin, Registry, RegistryStats};
use crate::response::{FetchResponse, RequestContext};
use crate::retry::{RetryConfig, RetryDecision};
use crate::transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse};
use crate::urls::{build_url, parse_base_url};
use tokio_util::sync::CancellationToken;

/// Selects cache keys by the path encoded in them (`invalidate_path`)
#[derive(Clone)]
pub enum PathSelector {
    /// Paths starting with this prefix
    Prefix(String),
    /// Paths matching this regex
    Pattern(Regex),
    /// Arbitrary predicate over the decoded path
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl From<&str> for PathSelector {
    fn from(prefix: &str) -> Self {
        Self::Prefix(prefix.to_string())
    }
}

impl From<Regex> for PathSelector {
    fn from(pattern: Regex) -> Self {
        Self::Pattern(pattern)
    }
}

impl PathSelector {
    fn matches(&self, path: &str) -> bool {
        match self {
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Self::Pattern(pattern) => pattern.is_match(path),
            Self::Predicate(predicate) => predicate(path),
        }
    }
}

/// Everything one attempt loop needs, resolved once per request
#[derive(Clone)]
struct AttemptParams {
    retry: RetryConfig,
    attempt_timeout: Option<Duration>,
    determine_type: Option<DetermineType>,
    on_before: Option<OnBeforeReq>,
    on_after: Option<OnAfterReq>,
}

/// Pipeline result: `Done` outcomes already emitted their terminal event
/// (inside the attempt-loop runner); `Fail` outcomes still need one.
enum PipeOut {
    Done(Result<FetchResponse>),
    Fail(FetchError),
}

struct EngineInner {
    name: Option<String>,
    base_url: RwLock<Url>,
    default_type: BodyKind,
    header_format: HeaderFormat,
    headers: PropertyStore,
    params: PropertyStore,
    state: RwLock<HashMap<String, Value>>,
    total_timeout: Option<Duration>,
    timeout: Option<Duration>,
    attempt_timeout: Option<Duration>,
    retry: RetryConfig,
    validate: ValidateHooks,
    modify_options: RwLock<Option<ModifyOptions>>,
    modify_method_options: RwLock<HashMap<Method, ModifyOptions>>,
    determine_type: Option<DetermineType>,
    dedupe: DedupePolicyEngine,
    cache: CachePolicyEngine,
    rate_limit: RateLimitPolicyEngine,
    registry: Registry,
    bus: EventBus,
    transport: Arc<dyn Transport>,
    root: CancellationToken,
    destroyed: AtomicBool,
}

/// Resilient HTTP client engine
///
/// Cheap to clone; clones share all state. Construct with
/// [`FetchEngine::new`] and an [`EngineConfig`].
#[derive(Clone)]
pub struct FetchEngine {
    inner: Arc<EngineInner>,
}

impl FetchEngine {
    /// Build an engine, validating the configuration
    pub fn new(config: EngineConfig) -> Result<Self> {
        let base_url = parse_base_url(&config.base_url)?;

        let headers = PropertyStore::new("header", config.validate.headers.clone());
        headers.seed(config.headers.clone(), config.method_headers.clone())?;
        let params = PropertyStore::new("param", config.validate.params.clone());
        params.seed(config.params.clone(), config.method_params.clone())?;

        let adapter = config
            .cache
            .adapter
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryAdapter::new()));
        let transport = config
            .transport
            .clone()
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new()));

        let bus = EventBus::new();
        if let Some(spy) = config.spy.clone() {
            bus.on(EventFilter::All, spy);
        }

        tracing::debug!(
            name = config.name.as_deref().unwrap_or("-"),
            base_url = %base_url,
            "engine created"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                name: config.name,
                base_url: RwLock::new(base_url),
                default_type: config.default_type,
                header_format: config.header_format,
                headers,
                params,
                state: RwLock::new(HashMap::new()),
                total_timeout: config.total_timeout,
                timeout: config.timeout,
                attempt_timeout: config.attempt_timeout,
                retry: config.retry,
                validate: config.validate,
                modify_options: RwLock::new(config.modify_options),
                modify_method_options: RwLock::new(config.modify_method_options),
                determine_type: config.determine_type,
                dedupe: DedupePolicyEngine::new(config.dedupe),
                cache: CachePolicyEngine::new(config.cache),
                rate_limit: RateLimitPolicyEngine::new(config.rate_limit),
                registry: Registry::new(adapter),
                bus,
                transport,
                root: CancellationToken::new(),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Request surface
    // ------------------------------------------------------------------

    /// Issue a request. The returned [`Abortable`] resolves to the typed
    /// response and exposes a cloneable abort handle. Must be called from
    /// within a tokio runtime.
    pub fn request(&self, method: Method, path: &str, options: CallOptions) -> Abortable {
        let inner = self.inner.clone();
        let scope = AbortScope::child_of(&inner.root);
        if let Some(token) = &options.cancel_token {
            scope.link(token);
        }
        let handle = AbortHandle::new(scope.clone());
        let path = path.to_string();
        let future =
            async move { EngineInner::run_request(inner, method, path, options, scope).await }
                .boxed();
        Abortable::new(future, handle)
    }

    pub fn get(&self, path: &str, options: CallOptions) -> Abortable {
        self.request(Method::GET, path, options)
    }

    pub fn post(&self, path: &str, options: CallOptions) -> Abortable {
        self.request(Method::POST, path, options)
    }

    pub fn put(&self, path: &str, options: CallOptions) -> Abortable {
        self.request(Method::PUT, path, options)
    }

    pub fn patch(&self, path: &str, options: CallOptions) -> Abortable {
        self.request(Method::PATCH, path, options)
    }

    pub fn delete(&self, path: &str, options: CallOptions) -> Abortable {
        self.request(Method::DELETE, path, options)
    }

    pub fn options(&self, path: &str, options: CallOptions) -> Abortable {
        self.request(Method::OPTIONS, path, options)
    }

    // ------------------------------------------------------------------
    // Header / param management
    // ------------------------------------------------------------------

    pub fn add_header(&self, name: &str, value: &str, method: Option<&Method>) -> Result<()> {
        self.inner.headers.set(name, value, method)?;
        self.emit_mutation(EventKind::FetchHeaderAdd, name, method);
        Ok(())
    }

    pub fn remove_header(&self, name: &str, method: Option<&Method>) -> Result<()> {
        let removed = self.inner.headers.remove(&[name], method)?;
        if !removed.is_empty() {
            self.emit_mutation(EventKind::FetchHeaderRemove, name, method);
        }
        Ok(())
    }

    pub fn has_header(&self, name: &str, method: Option<&Method>) -> bool {
        self.inner.headers.has(name, method)
    }

    /// Snapshot of the default headers
    pub fn headers(&self) -> HashMap<String, String> {
        self.inner.headers.defaults()
    }

    pub fn add_param(&self, name: &str, value: &str, method: Option<&Method>) -> Result<()> {
        self.inner.params.set(name, value, method)?;
        self.emit_mutation(EventKind::FetchParamAdd, name, method);
        Ok(())
    }

    pub fn remove_param(&self, name: &str, method: Option<&Method>) -> Result<()> {
        let removed = self.inner.params.remove(&[name], method)?;
        if !removed.is_empty() {
            self.emit_mutation(EventKind::FetchParamRemove, name, method);
        }
        Ok(())
    }

    pub fn has_param(&self, name: &str, method: Option<&Method>) -> bool {
        self.inner.params.has(name, method)
    }

    /// Snapshot of the default params
    pub fn params(&self) -> HashMap<String, String> {
        self.inner.params.defaults()
    }

    // ------------------------------------------------------------------
    // Instance state
    // ------------------------------------------------------------------

    /// Merge one key into the instance state (validated when a state hook
    /// is configured)
    pub fn set_state(&self, key: &str, value: Value) -> Result<()> {
        {
            let mut state = self.inner.state.write().expect("state poisoned");
            let mut next = state.clone();
            next.insert(key.to_string(), value);
            if let Some(validator) = &self.inner.validate.state {
                validator(&next).map_err(|message| {
                    FetchError::validation(
                        format!("state validation failed: {}", message),
                        ErrorContext::default(),
                    )
                })?;
            }
            *state = next;
        }
        let mut event = FetchEvent::new(EventKind::FetchStateSet);
        event.key = Some(key.to_string());
        event.state = Some(self.get_state());
        self.inner.emit(event);
        Ok(())
    }

    /// Clear the instance state
    pub fn reset_state(&self) {
        self.inner.state.write().expect("state poisoned").clear();
        self.inner.emit(FetchEvent::new(EventKind::FetchStateReset));
    }

    /// Deep clone of the instance state
    pub fn get_state(&self) -> HashMap<String, Value> {
        self.inner.state.read().expect("state poisoned").clone()
    }

    // ------------------------------------------------------------------
    // Config changes
    // ------------------------------------------------------------------

    /// Swap the base URL for subsequent requests
    pub fn change_base_url(&self, base_url: &str) -> Result<()> {
        let parsed = parse_base_url(base_url)?;
        *self.inner.base_url.write().expect("base url poisoned") = parsed.clone();
        let mut event = FetchEvent::new(EventKind::FetchUrlChange);
        event.url = Some(parsed);
        self.inner.emit(event);
        Ok(())
    }

    pub fn change_modify_options(&self, hook: Option<ModifyOptions>) {
        *self
            .inner
            .modify_options
            .write()
            .expect("modify options poisoned") = hook;
        self.inner
            .emit(FetchEvent::new(EventKind::FetchModifyOptionsChange));
    }

    pub fn change_modify_method_options(&self, method: Method, hook: Option<ModifyOptions>) {
        {
            let mut hooks = self
                .inner
                .modify_method_options
                .write()
                .expect("modify options poisoned");
            match hook {
                Some(hook) => {
                    hooks.insert(method, hook);
                }
                None => {
                    hooks.remove(&method);
                }
            }
        }
        self.inner
            .emit(FetchEvent::new(EventKind::FetchModifyMethodOptionsChange));
    }

    // ------------------------------------------------------------------
    // Cache surface
    // ------------------------------------------------------------------

    pub async fn clear_cache(&self) {
        self.inner.registry.clear_cache().await;
        self.inner.cache.reset_active();
    }

    pub async fn delete_cache(&self, key: &str) -> bool {
        let deleted = self.inner.registry.delete_cache(key).await;
        if deleted {
            self.inner.cache.unmark_active(key);
        }
        deleted
    }

    /// Delete every entry the predicate selects; returns how many
    pub async fn invalidate_cache(
        &self,
        predicate: impl Fn(&str, &CacheEntry) -> bool,
    ) -> usize {
        let mut removed = 0;
        for (key, entry) in self.inner.registry.cache_entries().await {
            if predicate(&key, &entry) {
                if self.inner.registry.delete_cache(&key).await {
                    self.inner.cache.unmark_active(&key);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Delete entries by the path encoded in their keys
    pub async fn invalidate_path(&self, selector: impl Into<PathSelector>) -> usize {
        let selector = selector.into();
        self.invalidate_cache(|key, _| {
            path_from_key(key)
                .map(|path| selector.matches(&path))
                .unwrap_or(false)
        })
        .await
    }

    pub async fn cache_stats(&self) -> RegistryStats {
        self.inner.registry.stats().await
    }

    // ------------------------------------------------------------------
    // Observability & lifecycle
    // ------------------------------------------------------------------

    /// Subscribe to events by name, wildcard, or regex
    pub fn on(&self, filter: impl Into<EventFilter>, listener: Listener) -> ListenerId {
        self.inner.bus.on(filter, listener)
    }

    /// Remove a listener
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.bus.off(id)
    }

    /// Current base URL
    pub fn base_url(&self) -> Url {
        self.inner.base_url.read().expect("base url poisoned").clone()
    }

    /// Instance name, if one was configured
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Tear the engine down: abort every live request and background
    /// revalidation, drop listeners, cache, in-flight and policy state.
    /// Subsequent `request` calls fail fast with `Destroyed`.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(
            name = self.inner.name.as_deref().unwrap_or("-"),
            "destroying engine"
        );
        self.inner.root.cancel();
        self.inner.bus.clear();
        self.inner.registry.clear_inflight();
        self.inner.registry.clear_cache().await;
        self.inner.dedupe.reset();
        self.inner.cache.reset();
        self.inner.rate_limit.reset();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    fn emit_mutation(&self, kind: EventKind, key: &str, method: Option<&Method>) {
        let mut event = FetchEvent::new(kind);
        event.key = Some(key.to_string());
        event.method = method.cloned();
        self.inner.emit(event);
    }
}

impl EngineInner {
    fn emit(&self, event: FetchEvent) {
        tracing::trace!(event = %event.kind(), "emit");
        self.bus.emit(&event);
    }

    fn emit_ctx(
        &self,
        kind: EventKind,
        ctx: &RequestContext,
        fill: impl FnOnce(&mut FetchEvent),
    ) {
        let mut event = FetchEvent::new(kind);
        event.method = Some(ctx.method.clone());
        event.path = Some(ctx.path.clone());
        event.url = Some(ctx.url.clone());
        event.payload = Some(ctx.payload.clone());
        event.headers = Some(ctx.headers.clone());
        event.params = Some(ctx.params.clone());
        event.state = Some(ctx.state.clone());
        event.attempt = Some(ctx.attempt);
        fill(&mut event);
        self.emit(event);
    }

    fn err_ctx(ctx: &RequestContext, attempt: u32) -> ErrorContext {
        ErrorContext::new(ctx.method.clone(), ctx.path.clone()).with_attempt(attempt)
    }

    fn aborted_error(scope: &AbortScope, ctx: &RequestContext, attempt: u32) -> FetchError {
        FetchError::aborted(scope.timer_fired(), scope.reason(), Self::err_ctx(ctx, attempt))
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    async fn run_request(
        inner: Arc<EngineInner>,
        method: Method,
        path: String,
        options: CallOptions,
        scope: AbortScope,
    ) -> Result<FetchResponse> {
        let on_error = options.on_error.clone();

        let out = Self::pipeline(inner.clone(), method, path, options, scope.clone()).await;
        let result = match out {
            PipeOut::Done(result) => result,
            PipeOut::Fail(err) => {
                let kind = if err.is_aborted() {
                    EventKind::FetchAbort
                } else {
                    EventKind::FetchError
                };
                let mut event = FetchEvent::new(kind);
                if let Some(ctx) = err.context() {
                    event.method = ctx.method.clone();
                    event.path = ctx.path.clone();
                    event.attempt = Some(ctx.attempt);
                }
                event.error = Some(err.to_string());
                inner.emit(event);
                Err(err)
            }
        };

        if let Err(err) = &result {
            if let Some(callback) = &on_error {
                callback(err);
            }
        }
        scope.disarm();
        result
    }

    async fn pipeline(
        inner: Arc<EngineInner>,
        method: Method,
        path: String,
        mut options: CallOptions,
        scope: AbortScope,
    ) -> PipeOut {
        // 1. Destroyed guard
        if inner.destroyed.load(Ordering::SeqCst) {
            return PipeOut::Fail(FetchError::Destroyed);
        }

        // 2. Timeout resolution: request total > request timeout >
        //    instance total > instance timeout
        let total_timeout = options
            .total_timeout
            .or(options.timeout)
            .or(inner.total_timeout)
            .or(inner.timeout);
        if let Some(timeout) = total_timeout {
            scope.arm(timeout);
        }
        let attempt_timeout = options.attempt_timeout.or(inner.attempt_timeout);

        // 3. Normalize into an immutable snapshot
        let ctx = match Self::normalize(&inner, &method, &path, &mut options) {
            Ok(ctx) => ctx,
            Err(err) => return PipeOut::Fail(err),
        };
        let params = AttemptParams {
            retry: options.retry.clone().unwrap_or_else(|| inner.retry.clone()),
            attempt_timeout,
            determine_type: options
                .determine_type
                .clone()
                .or_else(|| inner.determine_type.clone()),
            on_before: options.on_before_req.clone(),
            on_after: options.on_after_req.clone(),
        };

        // 4. Rate-limit guard
        if let Some(limit) = inner.rate_limit.resolve(&ctx.method, &ctx.path) {
            if inner.rate_limit.applies_to(&ctx) {
                let key = inner.rate_limit.key(&limit, &ctx);
                let bucket = inner.rate_limit.bucket_for(&key, &limit);
                if bucket.try_consume(1) {
                    inner.emit_ctx(EventKind::FetchRateLimitAcquire, &ctx, |e| {
                        e.key = Some(key.clone());
                    });
                } else if !limit.wait_for_token {
                    tracing::debug!(key = %key, "rate limit exhausted, rejecting");
                    inner.emit_ctx(EventKind::FetchRateLimitReject, &ctx, |e| {
                        e.key = Some(key.clone());
                    });
                    return PipeOut::Fail(FetchError::RateLimited {
                        capacity: bucket.capacity(),
                        context: Self::err_ctx(&ctx, 0),
                    });
                } else {
                    let wait = bucket.wait_time(1);
                    tracing::debug!(key = %key, wait_ms = wait.as_millis() as u64, "waiting for token");
                    inner.emit_ctx(EventKind::FetchRateLimitWait, &ctx, |e| {
                        e.key = Some(key.clone());
                        e.wait_ms = Some(wait.as_millis() as u64);
                    });
                    if let Some(callback) = inner.rate_limit.on_rate_limit() {
                        callback(&ctx, wait);
                    }
                    if !bucket.wait_and_consume(1, scope.token()).await {
                        return PipeOut::Fail(Self::aborted_error(&scope, &ctx, 0));
                    }
                    inner.emit_ctx(EventKind::FetchRateLimitAcquire, &ctx, |e| {
                        e.key = Some(key.clone());
                    });
                }
            }
        }

        // 5. Cache lookup
        let mut cache_plan: Option<(String, ResolvedCache)> = None;
        if let Some(cache_cfg) = inner.cache.resolve(&ctx.method, &ctx.path) {
            if !inner.cache.skips(&ctx) {
                let key = inner.cache.key(&cache_cfg, &ctx);
                let now = Instant::now();
                match inner.registry.get_cache(&key).await {
                    Some(entry) if entry.is_fresh(now) => {
                        inner.emit_ctx(EventKind::FetchCacheHit, &ctx, |e| {
                            e.key = Some(key.clone());
                        });
                        return PipeOut::Done(Ok(entry.value));
                    }
                    Some(entry) if entry.is_stale(now) => {
                        inner.emit_ctx(EventKind::FetchCacheStale, &ctx, |e| {
                            e.key = Some(key.clone());
                        });
                        Self::schedule_revalidation(
                            inner.clone(),
                            key,
                            cache_cfg,
                            ctx.clone(),
                            params.clone(),
                        );
                        return PipeOut::Done(Ok(entry.value));
                    }
                    _ => {
                        inner.emit_ctx(EventKind::FetchCacheMiss, &ctx, |e| {
                            e.key = Some(key.clone());
                        });
                        cache_plan = Some((key, cache_cfg));
                    }
                }
            }
        }

        // 6. Single-flight join-or-start
        if let Some(dedupe_cfg) = inner.dedupe.resolve(&ctx.method, &ctx.path) {
            if inner.dedupe.applies_to(&ctx) {
                let key = inner.dedupe.key(&dedupe_cfg, &ctx);
                // The leader future is registered before any transport
                // call; once first polled it runs as a detached task so
                // joiner cancellations never cancel it.
                let task_inner = inner.clone();
                let task_ctx = ctx.clone();
                let task_params = params.clone();
                let task_scope = scope.clone();
                let task_key = key.clone();
                let fallback_ctx = Self::err_ctx(&ctx, 0);
                let join = inner.registry.join_or_track(&key, move || {
                    async move {
                        let task = tokio::spawn(async move {
                            let result = Self::run_leader(
                                &task_inner,
                                &task_ctx,
                                &task_params,
                                &task_scope,
                                cache_plan,
                            )
                            .await;
                            task_inner.registry.remove_inflight(&task_key);
                            result
                        });
                        match task.await {
                            Ok(result) => result,
                            Err(join_err) => Err(FetchError::transport(
                                format!("in-flight request task failed: {}", join_err),
                                false,
                                fallback_ctx,
                                None,
                            )),
                        }
                    }
                    .boxed()
                });

                match join {
                    InflightJoin::Started(shared) => {
                        inner.emit_ctx(EventKind::FetchDedupeStart, &ctx, |e| {
                            e.key = Some(key.clone());
                        });
                        return PipeOut::Done(shared.await);
                    }
                    InflightJoin::Joined { shared, waiting } => {
                        tracing::debug!(key = %key, waiting, "joined in-flight request");
                        inner.emit_ctx(EventKind::FetchDedupeJoin, &ctx, |e| {
                            e.key = Some(key.clone());
                            e.waiting_count = Some(waiting);
                        });
                        // Derived future: the shared outcome, bounded by
                        // this joiner's own scope.
                        tokio::select! {
                            biased;

                            () = scope.cancelled() => {
                                return PipeOut::Fail(Self::aborted_error(&scope, &ctx, 0));
                            }
                            outcome = shared => return PipeOut::Done(outcome),
                        }
                    }
                }
            }
        }

        // No dedupe: run the attempt loop inline under the caller's scope
        PipeOut::Done(Self::run_leader(&inner, &ctx, &params, &scope, cache_plan).await)
    }

    /// Run the attempt loop to its terminal outcome, write the cache on
    /// success, and emit the terminal failure event. Used by the inline
    /// path and by dedupe leader tasks.
    async fn run_leader(
        inner: &Arc<EngineInner>,
        ctx: &RequestContext,
        params: &AttemptParams,
        scope: &AbortScope,
        cache_plan: Option<(String, ResolvedCache)>,
    ) -> Result<FetchResponse> {
        let result = Self::attempt_loop(inner, ctx, params, scope).await;
        match &result {
            Ok(response) => {
                if let Some((key, cache_cfg)) = cache_plan {
                    inner
                        .registry
                        .set_cache(&key, response.clone(), cache_cfg.ttl, cache_cfg.stale_in)
                        .await;
                    inner.cache.mark_active(&key);
                    inner.emit_ctx(EventKind::FetchCacheSet, ctx, |e| {
                        e.key = Some(key.clone());
                    });
                }
            }
            Err(err) => {
                let kind = if err.is_aborted() {
                    EventKind::FetchAbort
                } else {
                    EventKind::FetchError
                };
                inner.emit_ctx(kind, ctx, |e| {
                    e.attempt = Some(err.attempt());
                    e.error = Some(err.to_string());
                });
            }
        }
        result
    }

    /// The attempt loop: transport, parse, classify, retry with backoff.
    async fn attempt_loop(
        inner: &Arc<EngineInner>,
        base_ctx: &RequestContext,
        params: &AttemptParams,
        scope: &AbortScope,
    ) -> Result<FetchResponse> {
        let mut attempt: u32 = 1;
        loop {
            if scope.is_cancelled() {
                return Err(Self::aborted_error(scope, base_ctx, attempt));
            }

            let mut ctx = base_ctx.clone();
            ctx.attempt = attempt;

            // Per-attempt child scope, linked to the parent
            let child = params.attempt_timeout.map(|timeout| {
                let child = scope.child();
                child.arm(timeout);
                child
            });

            inner.emit_ctx(EventKind::FetchBefore, &ctx, |_| {});
            if let Some(callback) = &params.on_before {
                callback(&ctx);
            }

            let (body, payload_content_type) = ctx.payload.to_wire();
            let mut headers = ctx.headers.clone();
            if let Some(content_type) = payload_content_type {
                let already_set = headers
                    .keys()
                    .any(|name| name.eq_ignore_ascii_case("content-type"));
                if !already_set {
                    headers.insert("Content-Type".to_string(), content_type.to_string());
                }
            }
            let transport_request = TransportRequest {
                method: ctx.method.clone(),
                url: ctx.url.clone(),
                headers,
                body,
            };
            let send_token = child
                .as_ref()
                .map(|c| c.token().clone())
                .unwrap_or_else(|| scope.token().clone());

            let sent = inner.transport.send(transport_request, &send_token).await;
            if let Some(child) = &child {
                child.disarm();
            }

            let result: Result<FetchResponse> = match sent {
                Err(transport_err) => {
                    if scope.is_cancelled() {
                        Err(Self::aborted_error(scope, &ctx, attempt))
                    } else {
                        let attempt_timed_out =
                            child.as_ref().map(|c| c.timer_fired()).unwrap_or(false);
                        Err(FetchError::transport(
                            transport_err.message.clone(),
                            attempt_timed_out,
                            Self::err_ctx(&ctx, attempt),
                            Some(Arc::new(transport_err)),
                        ))
                    }
                }
                Ok(response) => {
                    inner.emit_ctx(EventKind::FetchAfter, &ctx, |_| {});
                    if let Some(callback) = &params.on_after {
                        callback(&ctx, &response.clone());
                    }
                    Self::interpret(inner, &ctx, response, params)
                }
            };

            match result {
                Ok(response) => {
                    inner.emit_ctx(EventKind::FetchResponse, &ctx, |e| {
                        e.data = Some(response.data.clone());
                    });
                    return Ok(response);
                }
                Err(err) => {
                    let delay = match params.retry.decision(&err, attempt) {
                        RetryDecision::Stop => return Err(err),
                        RetryDecision::Retry => params.retry.backoff_delay(attempt),
                        RetryDecision::After(delay) => delay,
                    };
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    inner.emit_ctx(EventKind::FetchRetry, &ctx, |e| {
                        e.delay_ms = Some(delay.as_millis() as u64);
                        e.error = Some(err.to_string());
                    });
                    tokio::select! {
                        biased;

                        () = scope.cancelled() => {
                            return Err(Self::aborted_error(scope, &ctx, attempt));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Parse the body and classify the exchange
    fn interpret(
        inner: &Arc<EngineInner>,
        ctx: &RequestContext,
        response: TransportResponse,
        params: &AttemptParams,
    ) -> Result<FetchResponse> {
        let kind = params
            .determine_type
            .as_ref()
            .and_then(|hook| hook(&response))
            .or_else(|| match response.content_type() {
                Some(content_type) => kind_for_content_type(content_type),
                None => Some(inner.default_type),
            });

        let Some(kind) = kind else {
            let content_type = response.content_type().unwrap_or("").to_string();
            tracing::warn!(content_type = %content_type, "unrecognized content type");
            return Err(FetchError::parse(
                Some(response.status),
                format!("unrecognized content type '{}'", content_type),
                Self::err_ctx(ctx, ctx.attempt).with_headers(response.headers.clone()),
            ));
        };

        let data = parse_body(kind, &response.body).map_err(|message| {
            tracing::warn!(kind = %kind, status = response.status, "body parse failed");
            FetchError::parse(
                Some(response.status),
                message,
                Self::err_ctx(ctx, ctx.attempt).with_headers(response.headers.clone()),
            )
        })?;

        if !response.is_success() {
            return Err(FetchError::Step {
                step: FetchStep::Response,
                status: response.status,
                message: format!("server responded with status {}", response.status),
                timed_out: false,
                context: Self::err_ctx(ctx, ctx.attempt)
                    .with_headers(response.headers.clone())
                    .with_data(data),
                cause: None,
            });
        }

        Ok(FetchResponse {
            data,
            headers: response.headers,
            status: response.status,
            request: ctx.clone(),
        })
    }

    /// Normalize into the request snapshot: modify hooks, merged headers
    /// (formatted), merged params, composed URL, state snapshot.
    fn normalize(
        inner: &Arc<EngineInner>,
        method: &Method,
        path: &str,
        options: &mut CallOptions,
    ) -> Result<RequestContext> {
        let state = inner.state.read().expect("state poisoned").clone();

        let modify = inner
            .modify_options
            .read()
            .expect("modify options poisoned")
            .clone();
        if let Some(hook) = modify {
            hook(options, &state);
        }
        let modify_method = inner
            .modify_method_options
            .read()
            .expect("modify options poisoned")
            .get(method)
            .cloned();
        if let Some(hook) = modify_method {
            hook(options, &state);
        }

        let mut headers = inner.headers.resolve(method, &options.headers);
        if !matches!(inner.header_format, HeaderFormat::Preserve) {
            headers = headers
                .into_iter()
                .map(|(name, value)| (inner.header_format.apply(&name), value))
                .collect();
        }
        if inner.validate.per_request_headers {
            if let Some(validator) = &inner.validate.headers {
                validator(&headers).map_err(|message| {
                    FetchError::validation(
                        format!("header validation failed: {}", message),
                        ErrorContext::new(method.clone(), path),
                    )
                })?;
            }
        }

        let merged_params = inner.params.resolve(method, &options.params);
        if inner.validate.per_request_params {
            if let Some(validator) = &inner.validate.params {
                validator(&merged_params).map_err(|message| {
                    FetchError::validation(
                        format!("param validation failed: {}", message),
                        ErrorContext::new(method.clone(), path),
                    )
                })?;
            }
        }

        let base = inner.base_url.read().expect("base url poisoned").clone();
        let url = build_url(&base, path, &merged_params)?;

        Ok(RequestContext {
            method: method.clone(),
            path: path.to_string(),
            url,
            headers,
            params: merged_params,
            payload: options.payload.clone(),
            state,
            attempt: 0,
        })
    }

    /// Background stale-while-revalidate refresh, coalesced per key
    fn schedule_revalidation(
        inner: Arc<EngineInner>,
        key: String,
        cache_cfg: ResolvedCache,
        ctx: RequestContext,
        params: AttemptParams,
    ) {
        if !inner.cache.begin_revalidation(&key) {
            return;
        }
        inner.emit_ctx(EventKind::FetchCacheRevalidate, &ctx, |e| {
            e.key = Some(key.clone());
        });

        let scope = AbortScope::child_of(&inner.root);
        tokio::spawn(async move {
            let result = Self::attempt_loop(&inner, &ctx, &params, &scope).await;
            match result {
                Ok(response) => {
                    inner
                        .registry
                        .set_cache(&key, response, cache_cfg.ttl, cache_cfg.stale_in)
                        .await;
                    inner.cache.mark_active(&key);
                    inner.emit_ctx(EventKind::FetchCacheSet, &ctx, |e| {
                        e.key = Some(key.clone());
                    });
                }
                Err(err) => {
                    // The stale value stays served until it expires
                    tracing::warn!(key = %key, error = %err, "background revalidation failed");
                    inner.emit_ctx(EventKind::FetchCacheRevalidateError, &ctx, |e| {
                        e.key = Some(key.clone());
                        e.error = Some(err.to_string());
                    });
                }
            }
            inner.cache.end_revalidation(&key);
        });
    }
}
