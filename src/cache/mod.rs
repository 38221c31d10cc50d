//! Response cache: the contract the proxy engine consumes, and its
//! in-memory implementation.
//!
//! ## Layout
//!
//! - [`Cache`]: capability set every store provides to the proxy.
//! - [`CachedResponse`]: the unit of storage.
//! - [`key`]: storage key derivation.
//! - [`policy`]: cacheability and freshness rules driven by HTTP headers.
//! - [`InMemoryCache`]: process-lifetime, TTL-only store.
//! - [`PurgeMiddleware`]: `PURGE` method gateway.

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;

use crate::http::{Headers, Method, Request, ResponseHead, StatusCode};

pub mod key;
pub mod memory;
pub mod policy;
pub mod purge;

pub use key::StorageKey;
pub use memory::InMemoryCache;
pub use purge::PurgeMiddleware;

/// Errors raised by a cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to serialize headers for the storage key: {0}")]
    Key(#[from] serde_json::Error),
}

/// How the cache took part in an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from a fresh cache entry.
    Hit,
    /// Fetched from the origin.
    Miss,
    /// Served from an invalid entry because the origin was unreachable.
    Stale,
    /// The origin was unreachable and nothing was cached.
    Error,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully buffered origin response together with the identity of the
/// request that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    /// Canonical URL of the originating request.
    pub url: String,
    pub method: Method,
    pub status: StatusCode,
    pub request_headers: Headers,
    pub response_headers: Headers,
    pub body: Bytes,
    /// When the fetch was initiated (or the origin's `Date`).
    pub created: SystemTime,
    /// After this instant the entry is stale. Set by [`Cache::save`].
    pub expires: SystemTime,
}

impl CachedResponse {
    /// Captures a response fetched for `request`. `expires` starts equal to
    /// `created` and is fixed by the store on save.
    pub fn new(request: &Request, head: ResponseHead, body: Bytes, created: SystemTime) -> Self {
        Self {
            url: request.url(),
            method: request.method().clone(),
            status: head.status,
            request_headers: request.headers().clone(),
            response_headers: head.headers,
            body,
            created,
            expires: created,
        }
    }
}

/// Source of the current time, swappable so freshness can be tested
/// against a simulated clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// The capability set the reverse proxy needs from a response store.
///
/// Only [`InMemoryCache`] ships with this crate; a persistent store can be
/// dropped in behind the same trait without touching the proxy engine.
///
/// `get` does not judge freshness: callers check
/// [`is_valid_for_request`](Cache::is_valid_for_request) on what it returns.
pub trait Cache: Send + Sync {
    /// Whether `request` may be answered from the cache at all.
    fn accepts_cache(&self, request: &Request) -> bool;

    /// Looks up the entry stored for `request`, fresh or not.
    fn get(&self, request: &Request) -> Option<CachedResponse>;

    /// Whether `cached` is fresh enough to answer `request`.
    fn is_valid_for_request(&self, cached: &CachedResponse, request: &Request) -> bool;

    /// Whether an origin response may be stored.
    fn is_cacheable(&self, response: &ResponseHead) -> bool;

    /// Stores `response`, overwriting any entry with the same key.
    fn save(&self, response: CachedResponse) -> Result<(), CacheError>;

    /// Drops every entry matching `request`'s URL and header hash, whatever
    /// its method. Returns the number of entries removed.
    fn purge(&self, request: &Request) -> usize;
}
