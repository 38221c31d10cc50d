//! `PURGE` method gateway.

use std::sync::Arc;

use tracing::{error, info};

use super::Cache;
use crate::context::Context;
use crate::http::{Method, Response, StatusCode};
use crate::middleware::{BoxOutcome, Middleware, Next, Outcome};

/// Answers `PURGE` requests by evicting every cached variant of the target
/// URL and replying `204 No Content`. The request never reaches the origin.
/// Any other method passes straight through.
pub struct PurgeMiddleware {
    cache: Arc<dyn Cache>,
}

impl PurgeMiddleware {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }
}

impl Middleware for PurgeMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxOutcome {
        if *ctx.request().method() != Method::Purge {
            return Box::pin(next.run(ctx));
        }

        let cache = Arc::clone(&self.cache);
        Box::pin(async move {
            let removed = cache.purge(ctx.request());
            info!(url = %ctx.request().url(), removed, "purged cache entries");

            let status = StatusCode::NO_CONTENT;
            if let Err(e) = ctx.writer().send(Response::new(status)).await {
                error!(error = %e, "failed to write purge response");
            }
            Outcome::new(status)
        })
    }
}
