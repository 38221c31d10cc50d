//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler function.
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::middleware::Outcome;

pub mod writer;

pub use writer::{Framing, ResponseWriter};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The HTTP front end.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function that writes its response through the request's
/// [`Context`].
///
/// # Examples
///
/// ```rust,no_run
/// use cachet::server::Server;
/// use cachet::context::Context;
/// use cachet::http::{Response, StatusCode};
/// use cachet::middleware::Outcome;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|ctx: Context| async move {
///         let _ = ctx.writer().send(Response::new(StatusCode::OK).body("Hello!")).await;
///         Outcome::new(StatusCode::OK)
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Bounds how long a connection may take to deliver the next request.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Bounds every individual write to a client.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler receives a [`Context`] and must return a [`Future`] that
    /// resolves to the [`Outcome`] of the exchange once the response has been
    /// written. The handler is wrapped in an [`Arc`] and shared across all
    /// spawned Tokio tasks, so it must be `Send + Sync + 'static`.
    ///
    /// This method runs until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Outcome> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "cachet listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let limits = (self.read_timeout, self.write_timeout);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler, limits).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, idles past the read timeout, or a response could
/// only be delimited by closing the connection.
async fn handle_connection<H, F>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    (read_timeout, write_timeout): (Duration, Duration),
) -> Result<(), std::io::Error>
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Outcome> + Send + 'static,
{
    let _ = stream.set_nodelay(true);
    let (mut reader, write_half) = stream.into_split();
    let writer = ResponseWriter::new(Box::new(write_half), write_timeout);
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    // Set when bytes left over from the previous request may hold the next one.
    let mut pipelined = false;

    loop {
        if !pipelined {
            let read = tokio::time::timeout(read_timeout, reader.read_buf(&mut buf)).await;
            let bytes_read = match read {
                Ok(read) => read?,
                Err(_) => {
                    debug!(peer = %peer_addr, "read timed out, closing connection");
                    break;
                }
            };

            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
        }
        pipelined = false;

        // Guard against excessively large requests.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            writer.send(too_large()).await?;
            break;
        }

        // Attempt to parse the buffered data as an HTTP request head.
        let (mut request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                // Headers not yet fully received, read more data.
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BAD_REQUEST)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                writer.send(response).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = match body_offset
            .checked_add(content_length)
            .filter(|&total| total <= MAX_REQUEST_SIZE)
        {
            Some(total) => total,
            None => {
                warn!(peer = %peer_addr, content_length, "declared body too large, sending 413");
                writer.send(too_large()).await?;
                break;
            }
        };
        if buf.len() < total_needed {
            continue;
        }

        let consumed = buf.split_to(total_needed);
        request.set_body(Bytes::copy_from_slice(&consumed[body_offset..]));

        writer.prepare(request.is_keep_alive(), request.version()).await;

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let outcome = handler(Context::new(request, peer_addr, writer.clone())).await;
        debug!(peer = %peer_addr, status = outcome.status.as_u16(), "exchange complete");

        if !writer.keep_alive().await {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
        pipelined = !buf.is_empty();
    }

    Ok(())
}

fn too_large() -> Response {
    Response::new(StatusCode::PAYLOAD_TOO_LARGE)
        .body("Request entity too large")
        .keep_alive(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn start_echo() -> SocketAddr {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(async move {
            let _ = server
                .run(|ctx: Context| async move {
                    let body = format!("{} {}", ctx.request().method(), ctx.request().path());
                    let _ = ctx.writer().send(Response::new(StatusCode::OK).body(body)).await;
                    Outcome::new(StatusCode::OK)
                })
                .await;
        });
        addr
    }

    async fn read_until_closed(stream: &mut TcpStream) -> String {
        let mut out = String::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut out))
            .await
            .unwrap()
            .unwrap();
        out
    }

    #[tokio::test]
    async fn overflowing_content_length_is_rejected() {
        let addr = start_echo().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n")
            .await
            .unwrap();

        let reply = read_until_closed(&mut stream).await;
        assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{reply}");
    }

    #[tokio::test]
    async fn declared_body_above_limit_is_rejected_up_front() {
        let addr = start_echo().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let head = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_REQUEST_SIZE + 1);
        stream.write_all(head.as_bytes()).await.unwrap();

        let reply = read_until_closed(&mut stream).await;
        assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{reply}");
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let addr = start_echo().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let reply = read_until_closed(&mut stream).await;
        let first = reply.find("GET /one").unwrap();
        let second = reply.find("GET /two").unwrap();
        assert!(first < second);
    }
}
