//! # cachet
//!
//! An HTTP caching reverse proxy on a from-scratch async HTTP/1.1 stack.
//!
//! Requests pass through a middleware [`Pipeline`](middleware::Pipeline):
//! an access log, the `PURGE` gateway, then the [`ReverseProxy`] which serves
//! fresh entries from the cache, forwards everything else to the origin, and
//! falls back to stale entries when the origin is down.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cachet::cache::{Cache, InMemoryCache, PurgeMiddleware};
//! use cachet::client::Upstream;
//! use cachet::middleware::{AccessLog, Pipeline, from_middleware};
//! use cachet::proxy::ReverseProxy;
//! use cachet::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new(Duration::from_secs(3600)));
//!     let upstream = Upstream::new("http", ":8000", Duration::from_secs(30))?;
//!
//!     let pipeline = Pipeline::new(vec![
//!         from_middleware(Arc::new(AccessLog)),
//!         from_middleware(Arc::new(PurgeMiddleware::new(Arc::clone(&cache)))),
//!         from_middleware(Arc::new(ReverseProxy::new(cache, upstream))),
//!     ]);
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(move |ctx| pipeline.handle(ctx)).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod proxy;
pub mod server;

pub use cache::{Cache, CacheStatus, InMemoryCache};
pub use config::Config;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::ReverseProxy;
pub use server::{Server, ServerError};
