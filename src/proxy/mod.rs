//! Caching reverse proxy.
//!
//! [`ReverseProxy`] is the terminal layer of the middleware pipeline. For
//! each request it consults the cache, forwards misses to the origin through
//! an [`Upstream`], streams the origin's answer to the client while keeping a
//! copy, and stores that copy when the cache rules allow it. When the origin
//! cannot be reached, a stored entry is served even if it is no longer fresh.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::BytesMut;
use tracing::{debug, error, warn};

use crate::cache::{Cache, CacheStatus, CachedResponse};
use crate::client::{Upstream, UpstreamResponse};
use crate::context::Context;
use crate::http::{Method, Request, Response, StatusCode};
use crate::middleware::{BoxOutcome, Middleware, Next, Outcome};
use crate::server::ResponseWriter;

pub mod stream;

pub use stream::{FLUSH_INTERVAL, PeriodicFlush};

/// Header attached to a response served from a stale entry.
pub const STALE_WARNING: (&str, &str) = ("Warning", "110 - \"Response is Stale\"");

/// The cache-aware forwarding engine.
#[derive(Clone)]
pub struct ReverseProxy {
    cache: Arc<dyn Cache>,
    upstream: Arc<Upstream>,
}

impl ReverseProxy {
    pub fn new(cache: Arc<dyn Cache>, upstream: Upstream) -> Self {
        Self {
            cache,
            upstream: Arc::new(upstream),
        }
    }

    /// Handles one request end to end and reports what was sent.
    pub async fn serve(&self, ctx: Context) -> Outcome {
        let (mut request, peer_addr, writer) = ctx.into_parts();
        self.rewrite(&mut request);

        let accepts_cache = self.cache.accepts_cache(&request);
        let mut fallback = None;
        if accepts_cache {
            if let Some(cached) = self.cache.get(&request) {
                if self.cache.is_valid_for_request(&cached, &request) {
                    let status = write_cached(&writer, &cached, false).await;
                    return Outcome::new(status).with_cache(CacheStatus::Hit);
                }
                fallback = Some(cached);
            }
        }

        request
            .headers_mut()
            .set("X-Forwarded-For", peer_addr.ip().to_string());

        let started = SystemTime::now();
        debug!(url = %request.url(), "fetching");
        match self.upstream.send(&request).await {
            Ok(response) => {
                self.relay(request, response, &writer, accepts_cache, started)
                    .await
            }
            Err(e) => {
                warn!(url = %request.url(), error = %e, "origin request failed");
                match fallback {
                    Some(cached) => {
                        let status = write_cached(&writer, &cached, true).await;
                        Outcome::new(status).with_cache(CacheStatus::Stale)
                    }
                    None => {
                        let status = StatusCode::BAD_GATEWAY;
                        if let Err(e) = writer.send(Response::new(status)).await {
                            error!(error = %e, "failed to write response to client");
                        }
                        Outcome::new(status).with_cache(CacheStatus::Error)
                    }
                }
            }
        }
    }

    /// Points `request` at the origin and drops the client's
    /// connection-scoped headers.
    fn rewrite(&self, request: &mut Request) {
        request.headers_mut().strip_hop_by_hop();
        request.set_origin(self.upstream.scheme(), self.upstream.authority());
    }

    /// Streams an origin response to the client, then decides whether to
    /// store it.
    async fn relay(
        &self,
        mut request: Request,
        response: UpstreamResponse,
        writer: &ResponseWriter,
        accepts_cache: bool,
        started: SystemTime,
    ) -> Outcome {
        let UpstreamResponse { head, mut body } = response;
        let status = head.status;
        let outcome = Outcome::new(status).with_cache(CacheStatus::Miss);
        let bodiless = *request.method() == Method::Head || status.is_bodiless();

        if let Err(e) = writer.send_head(&head, bodiless).await {
            error!(error = %e, "failed to write response head to client");
            writer.close_after_response().await;
            return outcome;
        }

        let flusher = PeriodicFlush::start(writer.clone(), FLUSH_INTERVAL);
        let mut copy = BytesMut::new();
        let mut origin_complete = true;
        let mut client_complete = true;
        loop {
            match body.next_chunk().await {
                Ok(Some(chunk)) => {
                    if accepts_cache {
                        copy.extend_from_slice(&chunk);
                    }
                    if let Err(e) = writer.write_body(&chunk).await {
                        error!(error = %e, "failed to write response body to client");
                        client_complete = false;
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(url = %request.url(), error = %e, "origin body ended early");
                    origin_complete = false;
                    break;
                }
            }
        }
        flusher.stop().await;

        if origin_complete && client_complete {
            if let Err(e) = writer.finish(body.trailers()).await {
                error!(error = %e, "failed to finish response to client");
                client_complete = false;
            }
        } else {
            let _ = writer.flush().await;
        }
        if !(origin_complete && client_complete) {
            writer.close_after_response().await;
            return outcome;
        }

        if accepts_cache && self.cache.is_cacheable(&head) {
            let created = head
                .headers
                .get("date")
                .and_then(|date| httpdate::parse_http_date(date.trim()).ok())
                .unwrap_or(started);
            request.headers_mut().remove("x-forwarded-for");
            let cached = CachedResponse::new(&request, head, copy.freeze(), created);
            if let Err(e) = self.cache.save(cached) {
                warn!(error = %e, "failed to save response");
            }
        }

        outcome
    }
}

impl Middleware for ReverseProxy {
    fn handle(&self, ctx: Context, _next: Next) -> BoxOutcome {
        let proxy = self.clone();
        Box::pin(async move { proxy.serve(ctx).await })
    }
}

/// Writes a stored response to the client, re-framed with `Content-Length`.
async fn write_cached(writer: &ResponseWriter, cached: &CachedResponse, stale: bool) -> StatusCode {
    let mut headers = cached.response_headers.clone();
    headers.strip_hop_by_hop();
    if stale {
        headers.insert(STALE_WARNING.0, STALE_WARNING.1);
    }

    let response = Response::from_parts(cached.status, headers, cached.body.clone());
    if let Err(e) = writer.send(response).await {
        error!(error = %e, "failed to write cached response to client");
    }
    cached.status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::http::{Headers, ResponseHead};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    /// Serves each scripted reply to one connection, in order.
    async fn origin<R>(replies: Vec<R>) -> (String, tokio::task::JoinHandle<Vec<String>>)
    where
        R: AsRef<str> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!(":{}", listener.local_addr().unwrap().port());
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for reply in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0; 8192];
                let n = socket.read(&mut buf).await.unwrap();
                seen.push(String::from_utf8_lossy(&buf[..n]).to_string());
                socket.write_all(reply.as_ref().as_bytes()).await.unwrap();
            }
            seen
        });
        (host, handle)
    }

    fn proxy(host: &str, cache: Arc<InMemoryCache>) -> ReverseProxy {
        let upstream = Upstream::new("http", host, Duration::from_secs(2)).unwrap();
        ReverseProxy::new(cache, upstream)
    }

    async fn exchange(proxy: &ReverseProxy, raw: &[u8]) -> (Outcome, String, bool) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let writer = ResponseWriter::new(Box::new(server), Duration::from_secs(1));
        let (mut request, offset) = Request::parse(raw).unwrap();
        request.set_body(Bytes::copy_from_slice(&raw[offset..]));
        writer.prepare(request.is_keep_alive(), request.version()).await;
        let ctx = Context::new(request, "10.0.0.9:5555".parse().unwrap(), writer.clone());

        let outcome = proxy.serve(ctx).await;
        let keep_alive = writer.keep_alive().await;
        drop(writer);
        (outcome, read_to_end(&mut client).await, keep_alive)
    }

    async fn read_to_end(client: &mut DuplexStream) -> String {
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    const GET_A: &[u8] = b"GET /a HTTP/1.1\r\nHost: proxy.local\r\nConnection: keep-alive\r\n\r\n";

    #[tokio::test]
    async fn miss_then_hit() {
        let (host, origin) = origin(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nCache-Control: max-age=60\r\n\r\nhello",
        ])
        .await;
        let cache = Arc::new(InMemoryCache::new(Duration::from_secs(3600)));
        let proxy = proxy(&host, Arc::clone(&cache));

        let (outcome, first, _) = exchange(&proxy, GET_A).await;
        assert_eq!(outcome.cache, Some(CacheStatus::Miss));
        assert!(first.ends_with("\r\n\r\nhello"));
        assert_eq!(cache.len(), 1);

        let (outcome, second, _) = exchange(&proxy, GET_A).await;
        assert_eq!(outcome.cache, Some(CacheStatus::Hit));
        assert_eq!(outcome.status, StatusCode::OK);
        assert!(second.contains("Content-Length: 5\r\n"));
        assert!(second.ends_with("\r\n\r\nhello"));

        let seen = origin.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("GET /a HTTP/1.1\r\n"));
        assert!(seen[0].contains("X-Forwarded-For: 10.0.0.9\r\n"));
        assert!(seen[0].contains(&format!("Host: localhost{host}\r\n")));
        assert!(!seen[0].contains("keep-alive"));
    }

    /// The stored entry for `GET /a` as the proxy keyed it.
    fn stored_a(proxy: &ReverseProxy, cache: &InMemoryCache) -> CachedResponse {
        let (mut request, _) = Request::parse(b"GET /a HTTP/1.1\r\nHost: proxy.local\r\n\r\n").unwrap();
        request.set_origin(proxy.upstream.scheme(), proxy.upstream.authority());
        cache.get(&request).unwrap()
    }

    #[tokio::test]
    async fn origin_date_sets_entry_age() {
        let date = httpdate::fmt_http_date(SystemTime::now() - Duration::from_secs(30));
        let reply = format!(
            "HTTP/1.1 200 OK\r\nDate: {date}\r\nCache-Control: max-age=10\r\nContent-Length: 2\r\n\r\nok"
        );
        let (host, origin) = origin(vec![reply.clone(), reply]).await;
        let cache = Arc::new(InMemoryCache::new(Duration::from_secs(3600)));
        let proxy = proxy(&host, Arc::clone(&cache));

        exchange(&proxy, GET_A).await;
        let stored = stored_a(&proxy, &cache);
        assert_eq!(stored.created, httpdate::parse_http_date(&date).unwrap());
        assert_eq!(stored.expires, stored.created + Duration::from_secs(10));

        // already past its max-age when it arrived
        let (outcome, _, _) = exchange(&proxy, GET_A).await;
        assert_eq!(outcome.cache, Some(CacheStatus::Miss));
        assert_eq!(origin.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unparseable_date_falls_back_to_forward_time() {
        let (host, _origin) = origin(vec![
            "HTTP/1.1 200 OK\r\nDate: sometime last week\r\nCache-Control: max-age=60\r\nContent-Length: 2\r\n\r\nok",
        ])
        .await;
        let cache = Arc::new(InMemoryCache::new(Duration::from_secs(3600)));
        let proxy = proxy(&host, Arc::clone(&cache));

        let before = SystemTime::now();
        exchange(&proxy, GET_A).await;
        let after = SystemTime::now();

        let stored = stored_a(&proxy, &cache);
        assert!(stored.created >= before && stored.created <= after);

        let (outcome, _, _) = exchange(&proxy, GET_A).await;
        assert_eq!(outcome.cache, Some(CacheStatus::Hit));
    }

    #[tokio::test]
    async fn chunked_origin_is_relayed_and_stored() {
        let (host, _origin) = origin(vec![
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
        ])
        .await;
        let cache = Arc::new(InMemoryCache::new(Duration::from_secs(3600)));
        let proxy = proxy(&host, Arc::clone(&cache));

        let (_, relayed, keep_alive) = exchange(&proxy, GET_A).await;
        assert!(relayed.contains("Transfer-Encoding: chunked\r\n"));
        assert!(relayed.ends_with("3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n"));
        assert!(keep_alive);

        let (outcome, cached, _) = exchange(&proxy, GET_A).await;
        assert_eq!(outcome.cache, Some(CacheStatus::Hit));
        assert!(!cached.contains("Transfer-Encoding"));
        assert!(cached.ends_with("Content-Length: 5\r\n\r\nabcde"));
    }

    #[tokio::test]
    async fn unreachable_origin_without_entry_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!(":{}", listener.local_addr().unwrap().port());
        drop(listener);

        let proxy = proxy(&host, Arc::new(InMemoryCache::new(Duration::from_secs(60))));
        let (outcome, out, _) = exchange(&proxy, GET_A).await;
        assert_eq!(outcome.status, StatusCode::BAD_GATEWAY);
        assert_eq!(outcome.cache, Some(CacheStatus::Error));
        assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(out.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[tokio::test]
    async fn unreachable_origin_serves_stale_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!(":{}", listener.local_addr().unwrap().port());
        drop(listener);

        let cache = Arc::new(InMemoryCache::new(Duration::ZERO));
        let proxy = proxy(&host, Arc::clone(&cache));

        let (mut request, _) = Request::parse(GET_A).unwrap();
        proxy.rewrite(&mut request);
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        let head = ResponseHead::new(StatusCode::OK, headers);
        let created = SystemTime::now() - Duration::from_secs(30);
        cache
            .save(CachedResponse::new(&request, head, "old news".into(), created))
            .unwrap();

        let (outcome, out, _) = exchange(&proxy, GET_A).await;
        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(outcome.cache, Some(CacheStatus::Stale));
        assert!(out.contains("Warning: 110 - \"Response is Stale\"\r\n"));
        assert!(out.ends_with("\r\n\r\nold news"));
    }

    #[tokio::test]
    async fn post_is_forwarded_and_not_stored() {
        let (host, origin) = origin(vec![
            "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}",
        ])
        .await;
        let cache = Arc::new(InMemoryCache::new(Duration::from_secs(3600)));
        let proxy = proxy(&host, Arc::clone(&cache));

        let raw = b"POST /api/songs/ HTTP/1.1\r\nHost: proxy.local\r\nContent-Length: 2\r\n\r\n{}";
        let (outcome, out, _) = exchange(&proxy, raw).await;
        assert_eq!(outcome.status, StatusCode::CREATED);
        assert_eq!(outcome.cache, Some(CacheStatus::Miss));
        assert!(out.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(cache.is_empty());
        assert_eq!(origin.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn uncacheable_status_is_not_stored() {
        let (host, _origin) = origin(vec!["HTTP/1.1 302 Found\r\nLocation: /b\r\nContent-Length: 0\r\n\r\n"]).await;
        let cache = Arc::new(InMemoryCache::new(Duration::from_secs(3600)));
        let proxy = proxy(&host, Arc::clone(&cache));

        let (outcome, _, _) = exchange(&proxy, GET_A).await;
        assert_eq!(outcome.status, StatusCode::FOUND);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn truncated_origin_body_closes_and_is_not_stored() {
        let (host, _origin) = origin(vec!["HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort"]).await;
        let cache = Arc::new(InMemoryCache::new(Duration::from_secs(3600)));
        let proxy = proxy(&host, Arc::clone(&cache));

        let (outcome, out, keep_alive) = exchange(&proxy, GET_A).await;
        assert_eq!(outcome.cache, Some(CacheStatus::Miss));
        assert!(out.ends_with("\r\n\r\nshort"));
        assert!(!keep_alive);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn head_response_keeps_origin_length() {
        let (host, _origin) = origin(vec!["HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n"]).await;
        let cache = Arc::new(InMemoryCache::new(Duration::from_secs(3600)));
        let proxy = proxy(&host, Arc::clone(&cache));

        let raw = b"HEAD /a HTTP/1.1\r\nHost: proxy.local\r\n\r\n";
        let (_, out, _) = exchange(&proxy, raw).await;
        assert!(out.contains("Content-Length: 42\r\n"));
        assert!(out.ends_with("\r\n\r\n"));

        let (outcome, cached, _) = exchange(&proxy, raw).await;
        assert_eq!(outcome.cache, Some(CacheStatus::Hit));
        assert!(cached.contains("Content-Length: 42\r\n"));
        assert!(cached.ends_with("\r\n\r\n"));
    }
}
