//! Transport capability
//!
//! One transport call is one HTTP exchange. The engine owns retries,
//! timeouts, and classification; the transport only moves bytes and must
//! honor the cancellation token it is handed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

/// One outgoing exchange
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

/// The raw result of an exchange
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl TransportResponse {
    /// 2xx check
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `Content-Type` header, matched case-insensitively
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
    }
}

/// Low-level exchange failure (connect, reset, cancellation)
#[derive(Debug, Clone, Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    pub message: String,
    #[source]
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        message: impl Into<String>,
        cause: Arc<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause),
        }
    }
}

/// Pluggable HTTP transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one exchange. Implementations MUST return promptly once
    /// `cancel` fires; the engine treats a cancelled exchange like any
    /// other transport failure and classifies it from its own scope state.
    async fn send(
        &self,
        request: TransportRequest,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError>;
}

/// Default transport backed by a shared `reqwest::Client`
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Wrap an already-configured client (connection pool, proxy, TLS)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                return Err(TransportError::new("exchange cancelled"));
            }
            result = builder.send() => result.map_err(|e| {
                TransportError::with_cause(format!("request failed: {}", e), Arc::new(e))
            })?,
        };

        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let body = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                return Err(TransportError::new("exchange cancelled while reading body"));
            }
            result = response.bytes() => result.map_err(|e| {
                TransportError::with_cause(format!("failed to read body: {}", e), Arc::new(e))
            })?,
        };

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_success_boundaries() {
        let mut response = TransportResponse {
            status: 200,
            headers: HashMap::new(),
            body: Bytes::new(),
        };
        assert!(response.is_success());
        response.status = 299;
        assert!(response.is_success());
        response.status = 301;
        assert!(!response.is_success());
        response.status = 499;
        assert!(!response.is_success());
    }

    #[test]
    fn test_content_type_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let response = TransportResponse {
            status: 200,
            headers,
            body: Bytes::new(),
        };
        assert_eq!(response.content_type(), Some("application/json"));
    }
}
