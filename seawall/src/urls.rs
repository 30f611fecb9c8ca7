//! URL composition

use std::collections::HashMap;

use url::Url;

use crate::error::{FetchError, Result};

/// Compose the final request URL from base, path, and merged params.
///
/// Absolute paths (`http://` / `https://`) are used directly; anything
/// else is concatenated onto the base. Query pairs already present in the
/// path are preserved; merged params overwrite same-named pairs and are
/// appended otherwise (sorted, for deterministic keys).
pub fn build_url(base: &Url, path: &str, params: &HashMap<String, String>) -> Result<Url> {
    let mut url = if path.starts_with("http://") || path.starts_with("https://") {
        Url::parse(path)
            .map_err(|e| FetchError::Config(format!("invalid absolute path '{}': {}", path, e)))?
    } else {
        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined)
            .map_err(|e| FetchError::Config(format!("cannot compose URL from '{}': {}", path, e)))?
    };

    if !params.is_empty() {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut sorted: Vec<(&String, &String)> = params.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in sorted {
            match pairs.iter_mut().find(|(existing, _)| existing == key) {
                Some(slot) => slot.1 = value.clone(),
                None => pairs.push((key.clone(), value.clone())),
            }
        }

        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(url)
}

/// Validate that a base URL is absolute http(s)
pub fn parse_base_url(base: &str) -> Result<Url> {
    let url = Url::parse(base)
        .map_err(|e| FetchError::Config(format!("invalid base URL '{}': {}", base, e)))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(FetchError::Config(format!(
                "base URL scheme must be http or https, got '{}'",
                other
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(FetchError::Config(format!("base URL '{}' has no host", base)));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        parse_base_url("https://api.example.com/v1").unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_relative_path_concatenates() {
        let url = build_url(&base(), "users/42", &HashMap::new()).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/users/42");

        let url = build_url(&base(), "/users/42", &HashMap::new()).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/users/42");
    }

    #[test]
    fn test_absolute_path_used_directly() {
        let url = build_url(&base(), "https://other.example.com/x", &HashMap::new()).unwrap();
        assert_eq!(url.as_str(), "https://other.example.com/x");
    }

    #[test]
    fn test_existing_query_preserved() {
        let url = build_url(&base(), "search?q=rust", &params(&[("page", "2")])).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/search?q=rust&page=2");
    }

    #[test]
    fn test_param_overrides_existing_pair() {
        let url = build_url(&base(), "search?page=1", &params(&[("page", "9")])).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/search?page=9");
    }

    #[test]
    fn test_base_url_must_be_http() {
        assert!(parse_base_url("ftp://example.com").is_err());
        assert!(parse_base_url("not a url").is_err());
        assert!(parse_base_url("https://example.com").is_ok());
    }
}
