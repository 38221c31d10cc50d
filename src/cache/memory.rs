//! In-memory response store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use super::key::{StorageKey, purge_fragment};
use super::{Cache, CacheError, CachedResponse, Clock, SystemClock, policy};
use crate::http::{Request, ResponseHead};

/// Process-lifetime map from [`StorageKey`] to [`CachedResponse`].
///
/// Entries leave only through [`Cache::purge`] or by being overwritten;
/// expiry is evaluated lazily on read and there is no size bound. Readers
/// share the lock, `save` and `purge` take it exclusively.
pub struct InMemoryCache {
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
    store: RwLock<HashMap<StorageKey, CachedResponse>>,
}

impl InMemoryCache {
    /// Creates an empty store. `default_ttl` applies to responses whose
    /// headers declare no TTL of their own.
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_clock(default_ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_ttl,
            clock,
            store: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Number of stored entries, fresh or stale.
    pub fn len(&self) -> usize {
        self.store.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn request_key(request: &Request) -> Result<StorageKey, CacheError> {
        StorageKey::new(request.method(), &request.url(), request.headers())
    }
}

impl Cache for InMemoryCache {
    fn accepts_cache(&self, request: &Request) -> bool {
        policy::accepts_cache(request)
    }

    fn get(&self, request: &Request) -> Option<CachedResponse> {
        let key = match Self::request_key(request) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "cannot derive storage key, treating as a miss");
                return None;
            }
        };

        let found = self
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        match &found {
            Some(_) => debug!(%key, "getting: response retrieved"),
            None => debug!(%key, "getting: response not found"),
        }
        found
    }

    fn is_valid_for_request(&self, cached: &CachedResponse, request: &Request) -> bool {
        policy::is_valid_for_request(cached, request, self.clock.now())
    }

    fn is_cacheable(&self, response: &ResponseHead) -> bool {
        policy::is_cacheable(response.status, &response.headers, self.clock.now())
    }

    fn save(&self, mut response: CachedResponse) -> Result<(), CacheError> {
        let key = StorageKey::new(&response.method, &response.url, &response.request_headers)?;
        let ttl = policy::response_ttl(&response.response_headers, self.clock.now())
            .unwrap_or(self.default_ttl)
            .min(policy::MAX_TTL);
        response.expires = response.created.checked_add(ttl).unwrap_or(response.created);

        debug!(%key, ?ttl, "saving: response saved");
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, response);
        Ok(())
    }

    fn purge(&self, request: &Request) -> usize {
        let fragment = match purge_fragment(&request.url(), request.headers()) {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!(error = %e, "cannot derive purge key, nothing purged");
                return 0;
            }
        };

        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        let before = store.len();
        store.retain(|key, _| !key.contains(&fragment));
        let removed = before - store.len();
        debug!(%fragment, removed, "purging");
        removed
    }
}
