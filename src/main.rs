//! cachet - HTTP caching reverse proxy.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cachet::cache::{Cache, InMemoryCache, PurgeMiddleware};
use cachet::client::Upstream;
use cachet::config::Args;
use cachet::middleware::{AccessLog, Pipeline, from_middleware};
use cachet::proxy::ReverseProxy;
use cachet::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("cachet={},info", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.load().context("failed to load configuration")?;
    info!(
        port = config.port,
        backend = %format!("{}://{}", config.backend.scheme, config.backend.host),
        default_ttl = ?config.default_ttl(),
        "starting cachet"
    );

    let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new(config.default_ttl()));
    let upstream = Upstream::new(
        &config.backend.scheme,
        &config.backend.host,
        config.backend_timeout(),
    )?;

    let pipeline = Pipeline::new(vec![
        from_middleware(Arc::new(AccessLog)),
        from_middleware(Arc::new(PurgeMiddleware::new(Arc::clone(&cache)))),
        from_middleware(Arc::new(ReverseProxy::new(cache, upstream))),
    ]);

    let server = Server::bind(format!("0.0.0.0:{}", config.port))
        .await?
        .read_timeout(config.read_timeout())
        .write_timeout(config.write_timeout());

    tokio::select! {
        result = server.run(move |ctx| pipeline.handle(ctx)) => result?,
        _ = tokio::signal::ctrl_c() => warn!("interrupt received, shutting down"),
    }

    Ok(())
}
