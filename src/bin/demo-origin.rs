//! A small origin server to put behind the proxy while trying it out.
//!
//! - `GET /` waits 500 ms, then dumps the request it received.
//! - `GET /status?status=N` answers with status `N` (plus `Location` for 301).
//! - `/api/songs/` accepts JSON on `POST`, and `PUT`/`PATCH`/`DELETE`.

use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cachet::context::Context;
use cachet::http::{Method, Response, StatusCode};
use cachet::middleware::Outcome;
use cachet::server::Server;

#[derive(Parser, Debug)]
#[command(name = "demo-origin")]
#[command(about = "Demo origin server for cachet")]
struct Args {
    /// Port to listen on
    #[arg(long, short, env = "DEMO_ORIGIN_PORT", default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "demo_origin=info,cachet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server = Server::bind(format!("0.0.0.0:{}", args.port)).await?;
    server.run(handle).await?;
    Ok(())
}

async fn handle(ctx: Context) -> Outcome {
    let request = ctx.request();
    info!(
        "http://{}{}",
        request.headers().get("host").unwrap_or(""),
        request.target()
    );

    let response = match request.path() {
        "/" => dump(&ctx).await,
        "/status" => status(&ctx),
        path if path.starts_with("/api/songs/") => songs(&ctx),
        _ => Response::new(StatusCode::NOT_FOUND).body("404 page not found\n"),
    };

    let status = response.status();
    if let Err(e) = ctx.writer().send(response).await {
        tracing::error!(error = %e, "failed to write response");
    }
    Outcome::new(status)
}

async fn dump(ctx: &Context) -> Response {
    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut body = b"--- Request dump ---\n\n".to_vec();
    body.extend_from_slice(&ctx.request().to_bytes());
    Response::new(StatusCode::OK).body_bytes(body)
}

fn status(ctx: &Context) -> Response {
    let request = ctx.request();
    if *request.method() != Method::Get {
        return Response::new(StatusCode::METHOD_NOT_ALLOWED);
    }

    let code = request
        .query_param("status")
        .and_then(|value| value.parse::<u16>().ok())
        .filter(|code| (200..600).contains(code));
    let Some(code) = code else {
        return Response::new(StatusCode::BAD_REQUEST).body("status must be between 200 and 599\n");
    };

    let status = StatusCode::from_u16(code);
    let response = Response::new(status);
    if status == StatusCode::MOVED_PERMANENTLY {
        response.header("Location", "/new-location")
    } else {
        response
    }
}

fn songs(ctx: &Context) -> Response {
    let request = ctx.request();
    match request.method() {
        Method::Put | Method::Patch | Method::Delete => Response::new(StatusCode::NO_CONTENT),
        Method::Post => match serde_json::from_slice::<serde_json::Value>(request.body()) {
            Ok(_) => Response::new(StatusCode::CREATED)
                .header("Content-Type", "application/json")
                .body_bytes(request.body().clone()),
            Err(_) => Response::new(StatusCode::BAD_REQUEST),
        },
        _ => Response::new(StatusCode::METHOD_NOT_ALLOWED),
    }
}
