//! Middleware pipeline: composable before/after request handler logic.
//!
//! This module defines the core types for building an ordered middleware stack.
//! Each middleware wraps the next layer, enabling request inspection,
//! short-circuit responses (the `PURGE` gateway) and after-the-fact logging
//! without coupling the proxy engine to those concerns.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`Pipeline`]: an ordered, shareable stack of handlers.
//! - [`from_middleware`]: converts a [`Middleware`] into a [`MiddlewareHandler`].
//! - [`AccessLog`]: built-in access logger.
//!
//! Responses are written straight to the client through the
//! [`ResponseWriter`](crate::server::ResponseWriter) in the [`Context`]; each
//! layer returns an [`Outcome`] describing what was sent.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::cache::CacheStatus;
use crate::{Response, StatusCode, context::Context};

/// What a pipeline produced for one request, once the response is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Status sent to the client.
    pub status: StatusCode,
    /// How the cache took part in the exchange, if at all.
    pub cache: Option<CacheStatus>,
}

impl Outcome {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            cache: None,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheStatus) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Boxed future returned by every middleware.
pub type BoxOutcome = Pin<Box<dyn Future<Output = Outcome> + Send>>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the next
/// middleware (or writes a fallback `500` response when the chain is exhausted
/// without any middleware generating a response).
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware stack is stored as a `MiddlewareHandler`.
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxOutcome + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cachet::middleware::{AccessLog, from_middleware};
///
/// let handler = from_middleware(Arc::new(AccessLog));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    pub fn new(middlewares: Arc<[MiddlewareHandler]>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its outcome.
    ///
    /// If no handler remains (i.e. the chain is exhausted without producing a
    /// response), a `500 Internal Server Error` is written as a safe fallback.
    pub async fn run(mut self, ctx: Context) -> Outcome {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else {
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            if ctx.writer().is_committed().await {
                return Outcome::new(status);
            }
            let response = Response::new(status).body("No response generated by middleware pipeline");
            if let Err(e) = ctx.writer().send(response).await {
                tracing::error!(error = %e, "failed to write fallback response");
            }
            Outcome::new(status)
        }
    }
}

/// An ordered middleware stack, shared by every connection.
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Arc<[MiddlewareHandler]>,
}

impl Pipeline {
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares: middlewares.into(),
        }
    }

    /// Runs `ctx` through the whole stack.
    pub fn handle(&self, ctx: Context) -> BoxOutcome {
        let next = Next::new(Arc::clone(&self.middlewares));
        Box::pin(next.run(ctx))
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: write a response through `ctx.writer()` and return
///   without calling `next`.
/// - **Observe**: call `next.run(ctx).await` and inspect the [`Outcome`].
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited across
///   `.await` points in multi-threaded runtimes.
/// - Implementations **should not** hold `&mut` references to shared state across
///   an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> BoxOutcome;
}

/// Built-in middleware that writes one access log line per exchange.
///
/// Emits a single `tracing::info!` record after the downstream handler
/// completes, carrying the client address, method, URL, status, elapsed
/// time and the cache flag:
///
/// ```text
/// [DONE] 127.0.0.1 "GET" /a (200) 1.2ms [HIT]
/// ```
pub struct AccessLog;

impl Middleware for AccessLog {
    fn handle(&self, ctx: Context, next: Next) -> BoxOutcome {
        Box::pin(async move {
            let start = Instant::now();
            let peer = ctx.peer_addr().ip();
            let method = ctx.request().method().as_str().to_string();
            let target = ctx.request().target();

            let outcome = next.run(ctx).await;

            let duration = start.elapsed();
            let flag = outcome.cache.map(|c| c.as_str()).unwrap_or("-");

            tracing::info!(
                "[DONE] {} \"{}\" {} ({}) {:?} [{}]",
                peer,
                method,
                target,
                outcome.status.as_u16(),
                duration,
                flag
            );

            outcome
        })
    }
}
