//! # seawall
//!
//! Resilient HTTP client engine: request lifecycle management for
//! applications that make many concurrent calls to backend APIs and must
//! degrade gracefully under transient failures and rate limits.
//!
//! ## Features
//!
//! - **Cancellation**: per-request abort scopes with hierarchical total
//!   and per-attempt timeouts
//! - **Retry**: attempt loop with exponential backoff and predicate-driven
//!   retry decisions
//! - **Single-flight**: concurrent identical requests collapse onto one
//!   transport call with a shared outcome
//! - **Caching**: TTL response cache with stale-while-revalidate and a
//!   pluggable adapter
//! - **Rate limiting**: per-route token buckets with wait-or-reject
//!   semantics
//! - **Observability**: 26 named lifecycle events, subscribable by name,
//!   wildcard, or regex
//!
//! ## Example
//!
//! ```rust,no_run
//! use seawall::{CallOptions, CachePolicyConfig, EngineConfig, FetchEngine};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> seawall::Result<()> {
//!     let engine = FetchEngine::new(
//!         EngineConfig::new("https://api.example.com")
//!             .with_header("Accept", "application/json")
//!             .with_total_timeout(Duration::from_secs(10))
//!             .with_cache(
//!                 CachePolicyConfig::enabled()
//!                     .with_ttl(Duration::from_secs(60))
//!                     .with_stale_in(Duration::from_secs(15)),
//!             ),
//!     )?;
//!
//!     let user = engine.get("/users/1", CallOptions::new()).await?;
//!     println!("status {}: {:?}", user.status, user.data);
//!
//!     engine.destroy().await;
//!     Ok(())
//! }
//! ```

pub mod abort;
pub mod body;
pub mod bucket;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod keys;
mod policy;
pub mod props;
pub mod registry;
pub mod response;
pub mod retry;
pub mod rules;
pub mod transport;
pub mod urls;

pub use abort::{AbortHandle, Abortable};
pub use body::{BodyKind, RequestBody, ResponseBody};
pub use bucket::{BucketSnapshot, TokenBucket};
pub use config::{
    CacheOverrides, CachePolicyConfig, CallOptions, DedupeOverrides, DedupePolicyConfig,
    DetermineType, EngineConfig, HeaderFormat, KeySerializer, ModifyOptions, OnAfterReq,
    OnBeforeReq, OnError, OnRateLimit, RateLimitOverrides, RateLimitPolicyConfig,
    RequestPredicate, StateValidator, ValidateHooks,
};
pub use engine::{FetchEngine, PathSelector};
pub use error::{ErrorContext, FetchError, FetchStep, Result};
pub use event::{EventBus, EventFilter, EventKind, FetchEvent, Listener, ListenerId};
pub use props::MapValidator;
pub use registry::{CacheAdapter, CacheEntry, InMemoryAdapter, RegistryStats};
pub use response::{FetchResponse, RequestContext};
pub use retry::{RetryConfig, RetryDecision};
pub use rules::{MatchParts, PolicyRule, RouteMatcher};
pub use transport::{ReqwestTransport, Transport, TransportError, TransportRequest, TransportResponse};

// Method re-export so callers don't need a direct `http` dependency
pub use http::Method;
