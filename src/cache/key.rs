//! Storage key derivation.
//!
//! A key is `METHOD_url_hash`, where `hash` is the SHA-256 of the request's
//! header set. The header set is canonicalised before hashing so that field
//! order and name case never matter, only content does.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

use super::CacheError;
use crate::http::headers::HOP_BY_HOP;
use crate::http::{Headers, Method};

/// The client address and the host (already part of the URL) never take part
/// in the header hash. Neither do connection-scoped fields.
const EXCLUDED: &[&str] = &["x-forwarded-for", "host"];

/// Identity of one cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(String);

impl StorageKey {
    /// Builds the key for `method` + `url` + `headers`.
    pub fn new(method: &Method, url: &str, headers: &Headers) -> Result<Self, CacheError> {
        Ok(Self(format!("{}_{}", method, purge_fragment(url, headers)?)))
    }

    /// Returns `true` if `fragment` occurs anywhere in this key.
    pub fn contains(&self, fragment: &str) -> bool {
        self.0.contains(fragment)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The method-independent tail of a key: `url_hash`.
pub fn purge_fragment(url: &str, headers: &Headers) -> Result<String, CacheError> {
    Ok(format!("{}_{}", url, hash_headers(headers)?))
}

/// Hex SHA-256 of the canonical JSON form of `headers`.
pub fn hash_headers(headers: &Headers) -> Result<String, CacheError> {
    let mut canonical: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let name = name.to_ascii_lowercase();
        if EXCLUDED.contains(&name.as_str()) || HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        canonical.entry(name).or_default().push(value);
    }
    for values in canonical.values_mut() {
        values.sort_unstable();
    }

    let json = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&json)))
}
