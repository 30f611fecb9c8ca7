//! Error types for the request pipeline
//!
//! Every terminal failure carries enough context to act on it: the method
//! and path, the attempt number, the pipeline step that failed, and (for
//! response-step failures) the status, headers, and any parsed body.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::Method;
use thiserror::Error;

use crate::body::ResponseBody;

/// Pipeline step at which a request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchStep {
    /// The transport exchange itself (connect, reset, attempt timeout)
    Fetch,
    /// Interpreting the response body
    Parse,
    /// A completed exchange with a non-success status
    Response,
}

impl fmt::Display for FetchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch"),
            Self::Parse => write!(f, "parse"),
            Self::Response => write!(f, "response"),
        }
    }
}

/// Synthesized status for transport-layer failures
pub const STATUS_TRANSPORT: u16 = 499;

/// Synthesized status for parse failures with no response status
pub const STATUS_UNKNOWN: u16 = 999;

/// Request context attached to an error
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// HTTP method of the failed request
    pub method: Option<Method>,
    /// Request path as given by the caller
    pub path: Option<String>,
    /// Attempt number the failure occurred on (1-based, 0 before the loop)
    pub attempt: u32,
    /// Response headers, when a response was received
    pub headers: Option<HashMap<String, String>>,
    /// Parsed response body, when one was available
    pub data: Option<ResponseBody>,
}

impl ErrorContext {
    /// Context for a request identified by method and path
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method: Some(method),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Set the attempt number
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Attach response headers
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Attach a parsed response body
    pub fn with_data(mut self, data: ResponseBody) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.method, &self.path) {
            (Some(method), Some(path)) => write!(f, "{} {}", method, path),
            (None, Some(path)) => write!(f, "{}", path),
            _ => write!(f, "<request>"),
        }
    }
}

/// Result type alias using the engine error
pub type Result<T> = std::result::Result<T, FetchError>;

/// Main error type for the engine
///
/// Cloneable so a single-flight outcome can be shared across joiners;
/// underlying causes are held behind `Arc`.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// A pipeline step failed: transport (499), parse, or non-2xx response
    #[error("{step} error for {context} (status {status}): {message}")]
    Step {
        /// Which step failed
        step: FetchStep,
        /// Response status, or a synthesized one (499 transport, 999 unknown)
        status: u16,
        /// Human-readable failure description
        message: String,
        /// Whether a per-attempt timeout produced this failure
        timed_out: bool,
        /// Request context
        context: ErrorContext,
        /// Underlying cause, when one exists
        #[source]
        cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    /// Token bucket exhausted and the route is configured not to wait
    #[error("rate limit exceeded for {context} (capacity {capacity})")]
    RateLimited {
        /// Bucket capacity that was exhausted
        capacity: u32,
        /// Request context
        context: ErrorContext,
    },

    /// The request was aborted, by the caller or by a total timeout
    #[error("request {context} aborted (timed_out: {timed_out})")]
    Aborted {
        /// True when the abort came from a fired timeout, not a manual abort
        timed_out: bool,
        /// Caller-supplied abort reason, if any
        reason: Option<String>,
        /// Request context
        context: ErrorContext,
    },

    /// An options or per-request validation hook rejected the request
    #[error("validation failed: {message}")]
    Validation {
        /// What the hook rejected
        message: String,
        /// Request context
        context: ErrorContext,
    },

    /// Operation attempted on a destroyed engine
    #[error("engine has been destroyed")]
    Destroyed,

    /// Engine construction failed (bad base URL, invalid option)
    #[error("configuration error: {0}")]
    Config(String),
}

impl FetchError {
    /// Transport-layer failure (status 499)
    pub fn transport(
        message: impl Into<String>,
        timed_out: bool,
        context: ErrorContext,
        cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Step {
            step: FetchStep::Fetch,
            status: STATUS_TRANSPORT,
            message: message.into(),
            timed_out,
            context,
            cause,
        }
    }

    /// Body parse failure, carrying the original response status
    pub fn parse(status: Option<u16>, message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Step {
            step: FetchStep::Parse,
            status: status.unwrap_or(STATUS_UNKNOWN),
            message: message.into(),
            timed_out: false,
            context,
            cause: None,
        }
    }

    /// Non-success response
    pub fn response(status: u16, context: ErrorContext) -> Self {
        Self::Step {
            step: FetchStep::Response,
            status,
            message: format!("server responded with status {}", status),
            timed_out: false,
            context,
            cause: None,
        }
    }

    /// Manual or timeout-driven abort
    pub fn aborted(timed_out: bool, reason: Option<String>, context: ErrorContext) -> Self {
        Self::Aborted {
            timed_out,
            reason,
            context,
        }
    }

    /// Validation hook rejection
    pub fn validation(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Validation {
            message: message.into(),
            context,
        }
    }

    /// Response status, when one applies to this error
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Step { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The pipeline step, for step errors
    pub fn step(&self) -> Option<FetchStep> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// True when this failure came from an abort (manual or timeout)
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// True when a timeout (attempt or total) produced this failure
    pub fn is_timed_out(&self) -> bool {
        match self {
            Self::Aborted { timed_out, .. } => *timed_out,
            Self::Step { timed_out, .. } => *timed_out,
            _ => false,
        }
    }

    /// Request context, when the error carries one
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Step { context, .. }
            | Self::RateLimited { context, .. }
            | Self::Aborted { context, .. }
            | Self::Validation { context, .. } => Some(context),
            Self::Destroyed | Self::Config(_) => None,
        }
    }

    /// Attempt number the failure occurred on
    pub fn attempt(&self) -> u32 {
        self.context().map(|c| c.attempt).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_display_lowercase() {
        assert_eq!(FetchStep::Fetch.to_string(), "fetch");
        assert_eq!(FetchStep::Parse.to_string(), "parse");
        assert_eq!(FetchStep::Response.to_string(), "response");
    }

    #[test]
    fn test_transport_error_status() {
        let err = FetchError::transport(
            "connection reset",
            false,
            ErrorContext::new(Method::GET, "/users"),
            None,
        );
        assert_eq!(err.status(), Some(STATUS_TRANSPORT));
        assert_eq!(err.step(), Some(FetchStep::Fetch));
        assert!(!err.is_aborted());
    }

    #[test]
    fn test_parse_error_defaults_unknown_status() {
        let err = FetchError::parse(None, "bad body", ErrorContext::default());
        assert_eq!(err.status(), Some(STATUS_UNKNOWN));
    }

    #[test]
    fn test_aborted_flags() {
        let ctx = ErrorContext::new(Method::GET, "/slow").with_attempt(2);
        let err = FetchError::aborted(true, None, ctx);
        assert!(err.is_aborted());
        assert!(err.is_timed_out());
        assert_eq!(err.attempt(), 2);
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_rate_limited_has_no_status() {
        let err = FetchError::RateLimited {
            capacity: 2,
            context: ErrorContext::new(Method::GET, "/r"),
        };
        assert_eq!(err.status(), None);
        assert!(err.to_string().contains("capacity 2"));
    }
}
