//! Cacheability and freshness rules.
//!
//! Every function here is pure: the current time is passed in, so the
//! store can evaluate them against any [`Clock`](super::Clock).

use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use regex::Regex;
use tracing::debug;

use super::CachedResponse;
use crate::http::{Headers, Method, Request, StatusCode};

/// Statuses that may be stored. Anything else is passed through uncached.
pub const CACHEABLE_STATUSES: [u16; 11] = [200, 203, 204, 206, 300, 301, 404, 405, 410, 414, 501];

/// Longest lifetime an entry is given, whatever its headers declare.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Date field that sets an absolute expiry on a response.
pub const EXPIRES: &str = "Expires";

/// Date field that sets an absolute freshness bound on a request.
pub const IF_MODIFIED_SINCE: &str = "If-Modified-Since";

static MAX_AGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"s?-?max-age=(?P<ttl>\d+)").expect("max-age pattern is valid"));

/// Whether `request` may be answered from a shared cache.
///
/// Only `GET` and `HEAD` qualify, and only when the client did not ask to
/// bypass the cache (`Pragma: no-cache`, `Cache-Control` with `no-cache`,
/// `no-store`, `max-age=0` or `s-max-age=0`) and sent no `Authorization`.
pub fn accepts_cache(request: &Request) -> bool {
    let headers = request.headers();
    let cache_control = headers.get("cache-control").unwrap_or("");

    let refused = !matches!(request.method(), Method::Get | Method::Head)
        || headers.get("pragma") == Some("no-cache")
        || cache_control.contains("no-cache")
        || cache_control.contains("no-store")
        || cache_control.contains("max-age=0")
        || cache_control.contains("s-max-age=0")
        || headers.contains("authorization");

    if refused {
        debug!("request doesn't accept cache");
    } else {
        debug!("request accepts cache");
    }
    !refused
}

/// Whether a response with this status may be stored.
pub fn is_status_cacheable(status: StatusCode) -> bool {
    CACHEABLE_STATUSES.contains(&status.as_u16())
}

/// Resolves the time-to-live declared by `headers`.
///
/// In priority order:
/// 1. `date_field` holding an HTTP date strictly after `now` → the remaining time;
/// 2. `Cache-Control` with `no-cache`, `no-store` or `private` → zero;
/// 3. `Cache-Control` with `max-age=N` or `s-max-age=N` → `N` seconds.
///
/// Returns `None` when nothing applies, so the caller can fall back to its
/// default. Malformed values fall through to the next rule.
pub fn resolve_ttl(headers: &Headers, date_field: &str, now: SystemTime) -> Option<Duration> {
    if let Some(ttl) = headers
        .get(date_field)
        .and_then(|value| httpdate::parse_http_date(value.trim()).ok())
        .and_then(|date| date.duration_since(now).ok())
        .filter(|remaining| !remaining.is_zero())
    {
        return Some(ttl);
    }

    let cache_control = headers.get("cache-control")?;
    if cache_control.contains("no-cache")
        || cache_control.contains("no-store")
        || cache_control.contains("private")
    {
        return Some(Duration::ZERO);
    }

    MAX_AGE
        .captures(cache_control)
        .and_then(|caps| caps.name("ttl")?.as_str().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// TTL declared by an origin response.
pub fn response_ttl(headers: &Headers, now: SystemTime) -> Option<Duration> {
    resolve_ttl(headers, EXPIRES, now)
}

/// Freshness bound a client put on its own request.
pub fn request_ttl(headers: &Headers, now: SystemTime) -> Option<Duration> {
    resolve_ttl(headers, IF_MODIFIED_SINCE, now)
}

/// Whether a response may be stored: whitelisted status and no explicit
/// zero TTL.
pub fn is_cacheable(status: StatusCode, headers: &Headers, now: SystemTime) -> bool {
    if !is_status_cacheable(status) {
        debug!(status = status.as_u16(), "response status code non cacheable");
        return false;
    }
    if response_ttl(headers, now) == Some(Duration::ZERO) {
        debug!("response non cacheable");
        return false;
    }
    true
}

/// Whether `cached` was created before the freshness bound `request` sets.
pub fn is_too_old_for_request(cached: &CachedResponse, request: &Request, now: SystemTime) -> bool {
    match request_ttl(request.headers(), now) {
        Some(ttl) => match now.checked_sub(ttl) {
            Some(oldest) => cached.created < oldest,
            None => false,
        },
        None => false,
    }
}

/// Whether `cached` is past its expiry.
pub fn has_expired(cached: &CachedResponse, now: SystemTime) -> bool {
    cached.expires < now
}

/// Whether `cached` can answer `request` as a fresh hit. The request's own
/// bound is checked before the entry's expiry.
pub fn is_valid_for_request(cached: &CachedResponse, request: &Request, now: SystemTime) -> bool {
    if is_too_old_for_request(cached, request, now) {
        debug!("response too old for the request");
        return false;
    }
    if has_expired(cached, now) {
        debug!("response expired");
        return false;
    }
    true
}
