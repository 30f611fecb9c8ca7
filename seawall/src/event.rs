//! Lifecycle events and the observer bus
//!
//! Every stage of the request pipeline emits a named event. Listeners
//! subscribe by exact name, by wildcard, or by regex over the kebab-case
//! event names (the same name table used in logs).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use http::Method;
use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::body::{RequestBody, ResponseBody};

/// Named lifecycle events emitted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FetchBefore,
    FetchAfter,
    FetchResponse,
    FetchError,
    FetchAbort,
    FetchRetry,
    FetchHeaderAdd,
    FetchHeaderRemove,
    FetchParamAdd,
    FetchParamRemove,
    FetchStateSet,
    FetchStateReset,
    FetchUrlChange,
    FetchModifyOptionsChange,
    FetchModifyMethodOptionsChange,
    FetchDedupeStart,
    FetchDedupeJoin,
    FetchCacheHit,
    FetchCacheMiss,
    FetchCacheStale,
    FetchCacheSet,
    FetchCacheRevalidate,
    FetchCacheRevalidateError,
    FetchRateLimitWait,
    FetchRateLimitReject,
    FetchRateLimitAcquire,
}

impl EventKind {
    /// Kebab-case event name, shared by regex listeners and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchBefore => "fetch-before",
            Self::FetchAfter => "fetch-after",
            Self::FetchResponse => "fetch-response",
            Self::FetchError => "fetch-error",
            Self::FetchAbort => "fetch-abort",
            Self::FetchRetry => "fetch-retry",
            Self::FetchHeaderAdd => "fetch-header-add",
            Self::FetchHeaderRemove => "fetch-header-remove",
            Self::FetchParamAdd => "fetch-param-add",
            Self::FetchParamRemove => "fetch-param-remove",
            Self::FetchStateSet => "fetch-state-set",
            Self::FetchStateReset => "fetch-state-reset",
            Self::FetchUrlChange => "fetch-url-change",
            Self::FetchModifyOptionsChange => "fetch-modify-options-change",
            Self::FetchModifyMethodOptionsChange => "fetch-modify-method-options-change",
            Self::FetchDedupeStart => "fetch-dedupe-start",
            Self::FetchDedupeJoin => "fetch-dedupe-join",
            Self::FetchCacheHit => "fetch-cache-hit",
            Self::FetchCacheMiss => "fetch-cache-miss",
            Self::FetchCacheStale => "fetch-cache-stale",
            Self::FetchCacheSet => "fetch-cache-set",
            Self::FetchCacheRevalidate => "fetch-cache-revalidate",
            Self::FetchCacheRevalidateError => "fetch-cache-revalidate-error",
            Self::FetchRateLimitWait => "fetch-ratelimit-wait",
            Self::FetchRateLimitReject => "fetch-ratelimit-reject",
            Self::FetchRateLimitAcquire => "fetch-ratelimit-acquire",
        }
    }

    /// All event kinds, in emission-order groups
    pub fn all() -> &'static [EventKind] {
        &[
            Self::FetchBefore,
            Self::FetchAfter,
            Self::FetchResponse,
            Self::FetchError,
            Self::FetchAbort,
            Self::FetchRetry,
            Self::FetchHeaderAdd,
            Self::FetchHeaderRemove,
            Self::FetchParamAdd,
            Self::FetchParamRemove,
            Self::FetchStateSet,
            Self::FetchStateReset,
            Self::FetchUrlChange,
            Self::FetchModifyOptionsChange,
            Self::FetchModifyMethodOptionsChange,
            Self::FetchDedupeStart,
            Self::FetchDedupeJoin,
            Self::FetchCacheHit,
            Self::FetchCacheMiss,
            Self::FetchCacheStale,
            Self::FetchCacheSet,
            Self::FetchCacheRevalidate,
            Self::FetchCacheRevalidateError,
            Self::FetchRateLimitWait,
            Self::FetchRateLimitReject,
            Self::FetchRateLimitAcquire,
        ]
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::all()
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or(())
    }
}

/// A single emitted event with its request context
///
/// Fields that do not apply to a given event kind are `None`.
#[derive(Debug, Clone, Default)]
pub struct FetchEvent {
    /// Which event fired (None only for the Default impl)
    pub kind: Option<EventKind>,
    /// HTTP method of the request, when request-scoped
    pub method: Option<Method>,
    /// Request path as given by the caller
    pub path: Option<String>,
    /// Fully composed URL
    pub url: Option<Url>,
    /// Request payload snapshot
    pub payload: Option<RequestBody>,
    /// Merged request headers snapshot
    pub headers: Option<HashMap<String, String>>,
    /// Merged request params snapshot
    pub params: Option<HashMap<String, String>>,
    /// Instance state snapshot
    pub state: Option<HashMap<String, Value>>,
    /// Attempt number, for attempt-loop events
    pub attempt: Option<u32>,
    /// Cache / dedupe / rate-limit key, where one applies
    pub key: Option<String>,
    /// Number of joiners waiting on the in-flight leader (`fetch-dedupe-join`)
    pub waiting_count: Option<usize>,
    /// Estimated wait for a token in milliseconds (`fetch-ratelimit-wait`)
    pub wait_ms: Option<u64>,
    /// Backoff delay before the next attempt in milliseconds (`fetch-retry`)
    pub delay_ms: Option<u64>,
    /// Error description, for failure events
    pub error: Option<String>,
    /// Parsed response data, for response events
    pub data: Option<ResponseBody>,
}

impl FetchEvent {
    /// A bare event of the given kind
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// The event kind; panics only if constructed via `Default`
    pub fn kind(&self) -> EventKind {
        self.kind.expect("event kind set at construction")
    }
}

/// Listener callback
pub type Listener = Arc<dyn Fn(&FetchEvent) + Send + Sync>;

/// How a listener selects events
#[derive(Clone)]
pub enum EventFilter {
    /// A single named event
    Name(EventKind),
    /// Every event
    All,
    /// Events whose kebab-case name matches the regex
    Pattern(Regex),
}

impl EventFilter {
    fn matches(&self, kind: EventKind) -> bool {
        match self {
            Self::Name(name) => *name == kind,
            Self::All => true,
            Self::Pattern(re) => re.is_match(kind.as_str()),
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        Self::Name(kind)
    }
}

impl From<Regex> for EventFilter {
    fn from(re: Regex) -> Self {
        Self::Pattern(re)
    }
}

/// Handle for removing a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registered {
    id: ListenerId,
    filter: EventFilter,
    listener: Listener,
}

/// Engine-owned observer bus
///
/// Listeners are invoked synchronously, outside the registry lock, in
/// registration order.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Registered>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for the given filter
    pub fn on(&self, filter: impl Into<EventFilter>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        listeners.push(Registered {
            id,
            filter: filter.into(),
            listener,
        });
        id
    }

    /// Remove a previously registered listener
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Emit an event to every matching listener
    pub fn emit(&self, event: &FetchEvent) {
        let kind = event.kind();
        let matching: Vec<Listener> = {
            let listeners = self.listeners.read().expect("listener registry poisoned");
            listeners
                .iter()
                .filter(|r| r.filter.matches(kind))
                .map(|r| Arc::clone(&r.listener))
                .collect()
        };
        for listener in matching {
            listener(event);
        }
    }

    /// Drop every listener (engine destruction)
    pub fn clear(&self) {
        self.listeners
            .write()
            .expect("listener registry poisoned")
            .clear();
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().expect("listener registry poisoned").len()
    }

    /// True when no listeners are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collector() -> (Listener, Arc<Mutex<Vec<EventKind>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Listener = Arc::new(move |event: &FetchEvent| {
            sink.lock().unwrap().push(event.kind());
        });
        (listener, seen)
    }

    #[test]
    fn test_name_roundtrip() {
        for kind in EventKind::all() {
            assert_eq!(EventKind::from_str(kind.as_str()), Ok(*kind));
        }
        assert!(EventKind::from_str("fetch-nope").is_err());
    }

    #[test]
    fn test_named_listener() {
        let bus = EventBus::new();
        let (listener, seen) = collector();
        bus.on(EventKind::FetchCacheHit, listener);

        bus.emit(&FetchEvent::new(EventKind::FetchCacheHit));
        bus.emit(&FetchEvent::new(EventKind::FetchCacheMiss));

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::FetchCacheHit]);
    }

    #[test]
    fn test_wildcard_listener() {
        let bus = EventBus::new();
        let (listener, seen) = collector();
        bus.on(EventFilter::All, listener);

        bus.emit(&FetchEvent::new(EventKind::FetchBefore));
        bus.emit(&FetchEvent::new(EventKind::FetchRetry));

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_regex_listener() {
        let bus = EventBus::new();
        let (listener, seen) = collector();
        bus.on(Regex::new("^fetch-cache-").unwrap(), listener);

        bus.emit(&FetchEvent::new(EventKind::FetchCacheSet));
        bus.emit(&FetchEvent::new(EventKind::FetchBefore));
        bus.emit(&FetchEvent::new(EventKind::FetchCacheStale));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::FetchCacheSet, EventKind::FetchCacheStale]
        );
    }

    #[test]
    fn test_off_removes_listener() {
        let bus = EventBus::new();
        let (listener, seen) = collector();
        let id = bus.on(EventFilter::All, listener);

        bus.emit(&FetchEvent::new(EventKind::FetchBefore));
        assert!(bus.off(id));
        bus.emit(&FetchEvent::new(EventKind::FetchBefore));

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!bus.off(id));
    }
}
