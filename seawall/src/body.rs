//! Request and response body representations
//!
//! The engine decides how to interpret a response body from the
//! `Content-Type` header (or an explicit per-request override) and parses
//! the raw bytes into a [`ResponseBody`] before handing them to the caller.

use std::fmt;

use bytes::Bytes;
use serde_json::Value;

/// How a response body should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyKind {
    /// Raw bytes, no interpretation
    ArrayBuffer,
    /// Raw bytes tagged with their content type
    Blob,
    /// `multipart/form-data` or url-encoded key/value pairs
    FormData,
    /// JSON document
    Json,
    /// UTF-8 text
    Text,
}

impl BodyKind {
    /// Stable lowercase name, used in logs and events
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArrayBuffer => "arrayBuffer",
            Self::Blob => "blob",
            Self::FormData => "formData",
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for BodyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload attached to an outgoing request
///
/// JSON payloads are serialized to UTF-8 on the wire; byte payloads pass
/// through untouched; form payloads are url-encoded.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    /// No payload
    #[default]
    None,
    /// JSON document, serialized with `serde_json`
    Json(Value),
    /// Plain text
    Text(String),
    /// Pre-encoded bytes, sent as-is
    Bytes(Bytes),
    /// Key/value pairs, sent url-encoded
    Form(Vec<(String, String)>),
}

impl RequestBody {
    /// Serialize into wire bytes plus the content type to advertise.
    ///
    /// Returns `(None, None)` for an empty payload. Callers only set the
    /// `Content-Type` header when the request did not already carry one.
    pub fn to_wire(&self) -> (Option<Bytes>, Option<&'static str>) {
        match self {
            Self::None => (None, None),
            Self::Json(value) => {
                let encoded = serde_json::to_vec(value).unwrap_or_default();
                (Some(Bytes::from(encoded)), Some("application/json"))
            }
            Self::Text(text) => (Some(Bytes::from(text.clone().into_bytes())), Some("text/plain")),
            Self::Bytes(bytes) => (Some(bytes.clone()), None),
            Self::Form(pairs) => {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (key, value) in pairs {
                    serializer.append_pair(key, value);
                }
                (
                    Some(Bytes::from(serializer.finish().into_bytes())),
                    Some("application/x-www-form-urlencoded"),
                )
            }
        }
    }

    /// True when there is nothing to send
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl From<Value> for RequestBody {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<&str> for RequestBody {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

/// Parsed response body
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Empty body (e.g. 204, or an empty JSON response)
    Empty,
    /// Parsed JSON document
    Json(Value),
    /// Decoded UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Bytes),
    /// Decoded form fields
    Form(Vec<(String, String)>),
}

impl ResponseBody {
    /// Borrow the JSON value, if this body parsed as JSON
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Borrow the text, if this body parsed as text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Borrow the raw bytes, if this body was kept binary
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Map a `Content-Type` header value onto a [`BodyKind`].
///
/// Returns `None` for content types the engine does not recognize; the
/// caller surfaces that as a parse-step error.
pub fn kind_for_content_type(content_type: &str) -> Option<BodyKind> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if mime.is_empty() {
        return None;
    }

    if mime.contains("form-urlencoded") {
        return Some(BodyKind::Text);
    }
    if mime.contains("form-data") {
        return Some(BodyKind::FormData);
    }
    if mime.contains("json") {
        return Some(BodyKind::Json);
    }
    if mime.starts_with("text/") || mime.contains("xml") || mime.contains("html") {
        return Some(BodyKind::Text);
    }

    let top_level = mime.split('/').next().unwrap_or("");
    match top_level {
        "image" | "audio" | "video" | "font" | "binary" | "application" => Some(BodyKind::Blob),
        _ => None,
    }
}

/// Parse raw body bytes according to the chosen kind.
///
/// An empty JSON body parses to [`ResponseBody::Empty`]; everything else
/// that fails to decode is reported as a parse failure message.
pub fn parse_body(kind: BodyKind, raw: &Bytes) -> Result<ResponseBody, String> {
    match kind {
        BodyKind::ArrayBuffer | BodyKind::Blob => Ok(ResponseBody::Bytes(raw.clone())),
        BodyKind::Json => {
            if raw.is_empty() {
                return Ok(ResponseBody::Empty);
            }
            serde_json::from_slice::<Value>(raw)
                .map(ResponseBody::Json)
                .map_err(|e| format!("invalid JSON body: {}", e))
        }
        BodyKind::Text => String::from_utf8(raw.to_vec())
            .map(ResponseBody::Text)
            .map_err(|e| format!("body is not valid UTF-8: {}", e)),
        BodyKind::FormData => {
            let pairs = url::form_urlencoded::parse(raw)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            Ok(ResponseBody::Form(pairs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_heuristic() {
        assert_eq!(kind_for_content_type("application/json"), Some(BodyKind::Json));
        assert_eq!(
            kind_for_content_type("application/json; charset=utf-8"),
            Some(BodyKind::Json)
        );
        assert_eq!(kind_for_content_type("text/plain"), Some(BodyKind::Text));
        assert_eq!(kind_for_content_type("application/xml"), Some(BodyKind::Text));
        assert_eq!(kind_for_content_type("text/html"), Some(BodyKind::Text));
        assert_eq!(
            kind_for_content_type("application/x-www-form-urlencoded"),
            Some(BodyKind::Text)
        );
        assert_eq!(
            kind_for_content_type("multipart/form-data; boundary=x"),
            Some(BodyKind::FormData)
        );
        assert_eq!(kind_for_content_type("image/png"), Some(BodyKind::Blob));
        assert_eq!(
            kind_for_content_type("application/octet-stream"),
            Some(BodyKind::Blob)
        );
        assert_eq!(kind_for_content_type("made/up"), None);
        assert_eq!(kind_for_content_type(""), None);
    }

    #[test]
    fn test_parse_json() {
        let raw = Bytes::from_static(br#"{"id":1}"#);
        let body = parse_body(BodyKind::Json, &raw).unwrap();
        assert_eq!(body.as_json().unwrap()["id"], 1);
    }

    #[test]
    fn test_parse_empty_json_is_empty() {
        let body = parse_body(BodyKind::Json, &Bytes::new()).unwrap();
        assert_eq!(body, ResponseBody::Empty);
    }

    #[test]
    fn test_parse_invalid_json_fails() {
        let raw = Bytes::from_static(b"{nope");
        assert!(parse_body(BodyKind::Json, &raw).is_err());
    }

    #[test]
    fn test_parse_form() {
        let raw = Bytes::from_static(b"a=1&b=two");
        let body = parse_body(BodyKind::FormData, &raw).unwrap();
        assert_eq!(
            body,
            ResponseBody::Form(vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string()),
            ])
        );
    }

    #[test]
    fn test_request_body_wire_json() {
        let body = RequestBody::Json(serde_json::json!({"n": 1}));
        let (bytes, ct) = body.to_wire();
        assert_eq!(ct, Some("application/json"));
        assert_eq!(bytes.unwrap(), Bytes::from_static(br#"{"n":1}"#));
    }

    #[test]
    fn test_request_body_wire_bytes_passthrough() {
        let payload = Bytes::from_static(&[0xde, 0xad]);
        let (bytes, ct) = RequestBody::Bytes(payload.clone()).to_wire();
        assert_eq!(bytes.unwrap(), payload);
        assert_eq!(ct, None);
    }
}
