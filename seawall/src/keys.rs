//! Deterministic key serialization
//!
//! Cache and dedupe share one canonical key: the method, path+query,
//! payload, and headers, each JSON-encoded with object keys sorted, joined
//! by `|`. Rate limiting defaults to a coarser per-endpoint key.

use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::Method;
use serde_json::Value;
use url::Url;

use crate::body::RequestBody;

/// JSON encoding with recursively sorted object keys
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Path plus query, the URL portion that participates in keys
pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn payload_value(payload: &RequestBody) -> Value {
    match payload {
        RequestBody::None => Value::Null,
        RequestBody::Json(value) => value.clone(),
        RequestBody::Text(text) => Value::String(text.clone()),
        RequestBody::Bytes(bytes) => Value::String(BASE64.encode(bytes)),
        RequestBody::Form(pairs) => Value::Array(
            pairs
                .iter()
                .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), Value::String(v.clone())]))
                .collect(),
        ),
    }
}

/// Canonical request key: `method | path+query | payload | headers`
pub fn request_key(
    method: &Method,
    url: &Url,
    payload: &RequestBody,
    headers: &HashMap<String, String>,
) -> String {
    let header_map: BTreeMap<&String, &String> = headers.iter().collect();
    let headers_value = Value::Object(
        header_map
            .into_iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    );

    [
        canonical_json(&Value::String(method.to_string())),
        canonical_json(&Value::String(path_and_query(url))),
        canonical_json(&payload_value(payload)),
        canonical_json(&headers_value),
    ]
    .join("|")
}

/// Default rate-limit key: one bucket per `METHOD|path` endpoint
pub fn rate_limit_key(method: &Method, url: &Url) -> String {
    format!("{}|{}", method, url.path())
}

/// Default path extractor for `invalidate_path`: decodes the second
/// `|`-segment of a canonical key back into the path+query string.
pub fn path_from_key(key: &str) -> Option<String> {
    let segment = key.split('|').nth(1)?;
    serde_json::from_str::<String>(segment).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"z": true, "m": [2, {"y": 0, "x": 1}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"m":[2,{"x":1,"y":0}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_request_key_is_stable_across_header_order() {
        let u = url("https://api.example.com/users?page=1");
        let mut headers_a = HashMap::new();
        headers_a.insert("b".to_string(), "2".to_string());
        headers_a.insert("a".to_string(), "1".to_string());
        let mut headers_b = HashMap::new();
        headers_b.insert("a".to_string(), "1".to_string());
        headers_b.insert("b".to_string(), "2".to_string());

        let key_a = request_key(&Method::GET, &u, &RequestBody::None, &headers_a);
        let key_b = request_key(&Method::GET, &u, &RequestBody::None, &headers_b);
        assert_eq!(key_a, key_b);
        assert!(key_a.starts_with(r#""GET"|"/users?page=1"|null|"#));
    }

    #[test]
    fn test_request_key_differs_by_payload() {
        let u = url("https://api.example.com/users");
        let empty = HashMap::new();
        let a = request_key(&Method::POST, &u, &RequestBody::Json(json!({"n": 1})), &empty);
        let b = request_key(&Method::POST, &u, &RequestBody::Json(json!({"n": 2})), &empty);
        assert_ne!(a, b);
    }

    #[test]
    fn test_rate_limit_key_ignores_query_and_headers() {
        let a = url("https://api.example.com/users?page=1");
        let b = url("https://api.example.com/users?page=2");
        assert_eq!(rate_limit_key(&Method::GET, &a), "GET|/users");
        assert_eq!(
            rate_limit_key(&Method::GET, &a),
            rate_limit_key(&Method::GET, &b)
        );
    }

    #[test]
    fn test_path_from_key_roundtrip() {
        let u = url("https://api.example.com/users/1?full=true");
        let key = request_key(&Method::GET, &u, &RequestBody::None, &HashMap::new());
        assert_eq!(path_from_key(&key), Some("/users/1?full=true".to_string()));
    }
}
