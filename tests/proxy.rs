//! End-to-end tests: a scripted origin and the full proxy pipeline, each on
//! an ephemeral port, driven by raw TCP clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use cachet::cache::{Cache, InMemoryCache, PurgeMiddleware};
use cachet::client::Upstream;
use cachet::context::Context;
use cachet::http::{Method, Response, StatusCode};
use cachet::middleware::{AccessLog, Outcome, Pipeline, from_middleware};
use cachet::proxy::ReverseProxy;
use cachet::server::Server;

struct Origin {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Origin {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Origin with a handful of fixed routes. Every request it receives is counted.
async fn start_origin() -> Origin {
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    let task = tokio::spawn(async move {
        let _ = server
            .run(move |ctx: Context| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    let request = ctx.request();
                    let response = match (request.method(), request.path()) {
                        (Method::Get, "/fresh") => Response::new(StatusCode::OK)
                            .header("Cache-Control", "max-age=60")
                            .body("fresh body"),
                        (Method::Get, "/short") => Response::new(StatusCode::OK)
                            .header("Cache-Control", "max-age=1")
                            .body(format!("short body {n}")),
                        (Method::Get, "/private") => Response::new(StatusCode::OK)
                            .header("Cache-Control", "private")
                            .body("mine"),
                        (Method::Post, "/songs/") => Response::new(StatusCode::CREATED)
                            .header("Content-Type", "application/json")
                            .body_bytes(request.body().clone()),
                        _ => Response::new(StatusCode::NOT_FOUND),
                    };
                    let status = response.status();
                    ctx.writer().send(response).await.unwrap();
                    Outcome::new(status)
                }
            })
            .await;
    });

    Origin { addr, hits, task }
}

/// Proxy pipeline in front of `origin`, returning its address and cache.
async fn start_proxy(origin: SocketAddr) -> (SocketAddr, Arc<InMemoryCache>) {
    let store = Arc::new(InMemoryCache::new(Duration::from_secs(3600)));
    let cache: Arc<dyn Cache> = store.clone();
    let upstream = Upstream::new("http", &format!(":{}", origin.port()), Duration::from_secs(2)).unwrap();

    let pipeline = Pipeline::new(vec![
        from_middleware(Arc::new(AccessLog)),
        from_middleware(Arc::new(PurgeMiddleware::new(Arc::clone(&cache)))),
        from_middleware(Arc::new(ReverseProxy::new(cache, upstream))),
    ]);

    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.run(move |ctx| pipeline.handle(ctx)).await;
    });
    (addr, store)
}

/// Sends one request on a fresh connection and reads until the proxy closes it.
async fn send(proxy: SocketAddr, method: &str, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut raw = format!("{method} {path} HTTP/1.1\r\nHost: proxy.test\r\nConnection: close\r\n");
    if !body.is_empty() {
        raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    raw.push_str("\r\n");
    raw.push_str(body);
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut out = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut out))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    out
}

fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let origin = start_origin().await;
    let (proxy, cache) = start_proxy(origin.addr).await;

    let first = send(proxy, "GET", "/fresh", "").await;
    let second = send(proxy, "GET", "/fresh", "").await;

    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body(&first), "fresh body");
    assert_eq!(body(&second), body(&first));
    assert_eq!(origin.hits(), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn expired_entry_is_refetched() {
    let origin = start_origin().await;
    let (proxy, _) = start_proxy(origin.addr).await;

    let first = send(proxy, "GET", "/short", "").await;
    let second = send(proxy, "GET", "/short", "").await;
    assert_eq!(body(&first), "short body 1");
    assert_eq!(body(&second), "short body 1");
    assert_eq!(origin.hits(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let third = send(proxy, "GET", "/short", "").await;
    assert_eq!(body(&third), "short body 2");
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn stale_entry_is_served_when_origin_is_down() {
    let origin = start_origin().await;
    let (proxy, _) = start_proxy(origin.addr).await;

    send(proxy, "GET", "/short", "").await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    origin.task.abort();
    let _ = origin.task.await;

    let stale = send(proxy, "GET", "/short", "").await;
    assert!(stale.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(stale.contains("Warning: 110 - \"Response is Stale\"\r\n"));
    assert_eq!(body(&stale), "short body 1");
}

#[tokio::test]
async fn unreachable_origin_without_entry_is_bad_gateway() {
    let origin = start_origin().await;
    let addr = origin.addr;
    origin.task.abort();
    let _ = origin.task.await;
    let (proxy, _) = start_proxy(addr).await;

    let response = send(proxy, "GET", "/fresh", "").await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    assert_eq!(body(&response), "");
}

#[tokio::test]
async fn post_is_never_cached() {
    let origin = start_origin().await;
    let (proxy, cache) = start_proxy(origin.addr).await;

    let payload = r#"{"title":"Song"}"#;
    let first = send(proxy, "POST", "/songs/", payload).await;
    let second = send(proxy, "POST", "/songs/", payload).await;

    assert!(first.starts_with("HTTP/1.1 201 Created\r\n"));
    assert_eq!(body(&first), payload);
    assert_eq!(body(&second), payload);
    assert_eq!(origin.hits(), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn private_responses_are_not_stored() {
    let origin = start_origin().await;
    let (proxy, cache) = start_proxy(origin.addr).await;

    send(proxy, "GET", "/private", "").await;
    send(proxy, "GET", "/private", "").await;
    assert_eq!(origin.hits(), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn purge_evicts_and_never_reaches_origin() {
    let origin = start_origin().await;
    let (proxy, cache) = start_proxy(origin.addr).await;

    send(proxy, "GET", "/fresh", "").await;
    assert_eq!(cache.len(), 1);

    let purge = send(proxy, "PURGE", "/fresh", "").await;
    assert!(purge.starts_with("HTTP/1.1 204 No Content\r\n"));
    assert!(cache.is_empty());
    assert_eq!(origin.hits(), 1);

    send(proxy, "GET", "/fresh", "").await;
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn keep_alive_connection_serves_several_requests() {
    let origin = start_origin().await;
    let (proxy, _) = start_proxy(origin.addr).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = "GET /fresh HTTP/1.1\r\nHost: proxy.test\r\n\r\n";
    let mut buf = vec![0; 4096];
    for _ in 0..2 {
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut seen = String::new();
        while !seen.ends_with("fresh body") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(seen.contains("Connection: keep-alive\r\n"));
    }
    assert_eq!(origin.hits(), 1);
}
