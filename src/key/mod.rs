//! Canonical cache key derivation.
//!
//! A cache key is built from a namespace and a set of request parameters:
//!
//! ```text
//! namespace:k1=v1&k2=v2
//! ```
//!
//! Parameters are sorted by name before joining, so semantically identical
//! requests produce identical keys regardless of call-site ordering. The
//! namespace prefix is what makes [`invalidate_by_prefix`] scoping possible.
//!
//! [`invalidate_by_prefix`]: crate::store::CacheStore::invalidate_by_prefix

use thiserror::Error;

/// Separator between the namespace prefix and the parameter string.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Errors produced when key inputs would silently collide.
///
/// These are caller programming errors: a namespace or parameter containing
/// one of the reserved delimiters (`:`, `=`, `&`) could map two different
/// requests onto the same key, so key building fails fast instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("namespace {0:?} contains the reserved delimiter ':'")]
    NamespaceDelimiter(String),

    #[error("parameter name must not be empty")]
    EmptyParamName,

    #[error("parameter name {0:?} contains a reserved delimiter")]
    ParamNameDelimiter(String),

    #[error("value {value:?} for parameter {name:?} contains a reserved delimiter")]
    ParamValueDelimiter { name: String, value: String },
}

/// Builds the canonical cache key for `namespace` and `params`.
///
/// Parameters are sorted by name (ties broken by value, so duplicate names
/// still canonicalize deterministically) and joined as `k=v` pairs with `&`.
/// Missing parameters are simply omitted — an empty slice yields `namespace:`.
///
/// # Errors
///
/// Returns a [`KeyError`] when the namespace or any parameter contains a
/// reserved delimiter; see the enum docs.
///
/// # Examples
///
/// ```
/// use recache::key::build_key;
///
/// let a = build_key("jobs", &[("region", "eu"), ("page", "2")]).unwrap();
/// let b = build_key("jobs", &[("page", "2"), ("region", "eu")]).unwrap();
/// assert_eq!(a, "jobs:page=2&region=eu");
/// assert_eq!(a, b);
/// ```
pub fn build_key(namespace: &str, params: &[(&str, &str)]) -> Result<String, KeyError> {
    if namespace.is_empty() {
        return Err(KeyError::EmptyNamespace);
    }
    if namespace.contains(NAMESPACE_SEPARATOR) {
        return Err(KeyError::NamespaceDelimiter(namespace.to_string()));
    }

    let mut pairs: Vec<(&str, &str)> = Vec::with_capacity(params.len());
    for &(name, value) in params {
        if name.is_empty() {
            return Err(KeyError::EmptyParamName);
        }
        if name.contains(['=', '&', NAMESPACE_SEPARATOR]) {
            return Err(KeyError::ParamNameDelimiter(name.to_string()));
        }
        if value.contains(['=', '&']) {
            return Err(KeyError::ParamValueDelimiter {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        pairs.push((name, value));
    }
    pairs.sort_unstable();

    let mut key = String::with_capacity(namespace.len() + 1 + params.len() * 16);
    key.push_str(namespace);
    key.push(NAMESPACE_SEPARATOR);
    for (i, (name, value)) in pairs.iter().enumerate() {
        if i > 0 {
            key.push('&');
        }
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    Ok(key)
}
