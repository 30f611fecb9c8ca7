//! Layered header / param storage
//!
//! One store instance holds default values plus per-method overrides.
//! Resolution order is defaults, then method overrides, then per-request
//! overrides (later wins). Keys are stored case-sensitively; any
//! formatting (lowercasing etc.) is a separate normalization step owned
//! by the engine, not this store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use http::Method;

use crate::error::{ErrorContext, FetchError, Result};

/// Validation hook run against the full map after every mutation
pub type MapValidator =
    Arc<dyn Fn(&HashMap<String, String>) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Default, Clone)]
struct Maps {
    defaults: HashMap<String, String>,
    per_method: HashMap<Method, HashMap<String, String>>,
}

/// Thread-safe property store for headers or params
pub struct PropertyStore {
    label: &'static str,
    maps: RwLock<Maps>,
    validator: Option<MapValidator>,
}

impl PropertyStore {
    /// Create a store labeled for error messages ("header" / "param")
    pub fn new(label: &'static str, validator: Option<MapValidator>) -> Self {
        Self {
            label,
            maps: RwLock::new(Maps::default()),
            validator,
        }
    }

    /// Seed defaults and method overrides at engine construction
    pub fn seed(
        &self,
        defaults: HashMap<String, String>,
        per_method: HashMap<Method, HashMap<String, String>>,
    ) -> Result<()> {
        let mut maps = self.maps.write().expect("property store poisoned");
        let mut next = maps.clone();
        next.defaults = defaults;
        next.per_method = per_method;
        self.validate(&next)?;
        *maps = next;
        Ok(())
    }

    /// Set one key, optionally scoped to a method
    pub fn set(&self, key: &str, value: &str, method: Option<&Method>) -> Result<()> {
        let mut maps = self.maps.write().expect("property store poisoned");
        let mut next = maps.clone();
        match method {
            Some(m) => {
                next.per_method
                    .entry(m.clone())
                    .or_default()
                    .insert(key.to_string(), value.to_string());
            }
            None => {
                next.defaults.insert(key.to_string(), value.to_string());
            }
        }
        self.validate(&next)?;
        *maps = next;
        Ok(())
    }

    /// Set many keys at once
    pub fn set_many(&self, values: &HashMap<String, String>, method: Option<&Method>) -> Result<()> {
        let mut maps = self.maps.write().expect("property store poisoned");
        let mut next = maps.clone();
        let target = match method {
            Some(m) => next.per_method.entry(m.clone()).or_default(),
            None => &mut next.defaults,
        };
        for (key, value) in values {
            target.insert(key.clone(), value.clone());
        }
        self.validate(&next)?;
        *maps = next;
        Ok(())
    }

    /// Remove keys; returns the keys that were actually present
    pub fn remove(&self, keys: &[&str], method: Option<&Method>) -> Result<Vec<String>> {
        let mut maps = self.maps.write().expect("property store poisoned");
        let mut next = maps.clone();
        let target = match method {
            Some(m) => next.per_method.entry(m.clone()).or_default(),
            None => &mut next.defaults,
        };
        let mut removed = Vec::new();
        for key in keys {
            if target.remove(*key).is_some() {
                removed.push((*key).to_string());
            }
        }
        self.validate(&next)?;
        *maps = next;
        Ok(removed)
    }

    /// Whether a key is set, in defaults or for the given method
    pub fn has(&self, key: &str, method: Option<&Method>) -> bool {
        let maps = self.maps.read().expect("property store poisoned");
        match method {
            Some(m) => maps
                .per_method
                .get(m)
                .map(|overrides| overrides.contains_key(key))
                .unwrap_or(false),
            None => maps.defaults.contains_key(key),
        }
    }

    /// Defaults merged with the overrides for one method
    pub fn for_method(&self, method: &Method) -> HashMap<String, String> {
        let maps = self.maps.read().expect("property store poisoned");
        let mut merged = maps.defaults.clone();
        if let Some(overrides) = maps.per_method.get(method) {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Full resolution: defaults → method overrides → request overrides
    pub fn resolve(
        &self,
        method: &Method,
        request_overrides: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut merged = self.for_method(method);
        for (key, value) in request_overrides {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Snapshot of the default map
    pub fn defaults(&self) -> HashMap<String, String> {
        self.maps
            .read()
            .expect("property store poisoned")
            .defaults
            .clone()
    }

    fn validate(&self, maps: &Maps) -> Result<()> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        validator(&maps.defaults).map_err(|message| {
            FetchError::validation(
                format!("{} validation failed: {}", self.label, message),
                ErrorContext::default(),
            )
        })?;
        for overrides in maps.per_method.values() {
            validator(overrides).map_err(|message| {
                FetchError::validation(
                    format!("{} validation failed: {}", self.label, message),
                    ErrorContext::default(),
                )
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PropertyStore {
        PropertyStore::new("header", None)
    }

    #[test]
    fn test_resolve_order() {
        let store = store();
        store.set("Accept", "application/json", None).unwrap();
        store.set("X-Scope", "default", None).unwrap();
        store.set("X-Scope", "post", Some(&Method::POST)).unwrap();

        let mut request = HashMap::new();
        request.insert("X-Scope".to_string(), "request".to_string());

        let merged = store.resolve(&Method::POST, &request);
        assert_eq!(merged["Accept"], "application/json");
        assert_eq!(merged["X-Scope"], "request");

        let merged = store.resolve(&Method::POST, &HashMap::new());
        assert_eq!(merged["X-Scope"], "post");

        let merged = store.resolve(&Method::GET, &HashMap::new());
        assert_eq!(merged["X-Scope"], "default");
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let store = store();
        store.set("x-token", "a", None).unwrap();
        assert!(store.has("x-token", None));
        assert!(!store.has("X-Token", None));
    }

    #[test]
    fn test_remove_reports_removed_keys() {
        let store = store();
        store.set("a", "1", None).unwrap();
        let removed = store.remove(&["a", "missing"], None).unwrap();
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(!store.has("a", None));
    }

    #[test]
    fn test_validator_rejects_and_rolls_back() {
        let validator: MapValidator = Arc::new(|map| {
            if map.contains_key("forbidden") {
                Err("forbidden key".to_string())
            } else {
                Ok(())
            }
        });
        let store = PropertyStore::new("header", Some(validator));

        store.set("ok", "1", None).unwrap();
        assert!(store.set("forbidden", "1", None).is_err());
        assert!(!store.has("forbidden", None));
        assert!(store.has("ok", None));
    }
}
