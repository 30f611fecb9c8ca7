//! Request snapshots and typed responses

use std::collections::HashMap;

use http::Method;
use serde_json::Value;
use url::Url;

use crate::body::{RequestBody, ResponseBody};

/// Immutable snapshot of a request, taken at normalization time
///
/// Engine-level mutations (headers, params, state, base URL) made after
/// normalization never affect an in-flight request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP method
    pub method: Method,
    /// Path as given by the caller
    pub path: String,
    /// Fully composed URL (base + path + merged params)
    pub url: Url,
    /// Merged headers (defaults → method → request)
    pub headers: HashMap<String, String>,
    /// Merged params
    pub params: HashMap<String, String>,
    /// Request payload
    pub payload: RequestBody,
    /// Instance state snapshot
    pub state: HashMap<String, Value>,
    /// Attempt this snapshot belongs to (1-based)
    pub attempt: u32,
}

/// A completed, parsed response
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Parsed body
    pub data: ResponseBody,
    /// Response headers, flattened
    pub headers: HashMap<String, String>,
    /// HTTP status
    pub status: u16,
    /// The request snapshot that produced this response
    pub request: RequestContext,
}
