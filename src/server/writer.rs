//! Client-facing response writer.
//!
//! A [`ResponseWriter`] owns the write half of one client connection. It is
//! cheap to clone so a streamed response can be flushed from a helper task
//! while the body is still being copied.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::http::{Headers, Response, ResponseHead};

/// Type-erased write half of a client connection.
pub type ClientIo = Box<dyn AsyncWrite + Send + Unpin>;

/// How the body of a streamed response is delimited on the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body follows the head (HEAD replies, 1xx, 204, 304).
    Empty,
    /// The origin's `Content-Length` is passed through.
    Length,
    /// `Transfer-Encoding: chunked`, trailers allowed.
    Chunked,
    /// The body ends when the connection closes (HTTP/1.0 clients).
    Close,
}

struct WriterState {
    io: BufWriter<ClientIo>,
    write_timeout: Duration,
    framing: Framing,
    committed: bool,
    keep_alive: bool,
    version: u8,
}

/// Shared handle to the write half of a client connection.
#[derive(Clone)]
pub struct ResponseWriter {
    state: Arc<Mutex<WriterState>>,
}

impl ResponseWriter {
    /// Wraps `io`; every write must complete within `write_timeout`.
    pub fn new(io: ClientIo, write_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(WriterState {
                io: BufWriter::new(io),
                write_timeout,
                framing: Framing::Empty,
                committed: false,
                keep_alive: true,
                version: 1,
            })),
        }
    }

    /// Resets per-request state before the next request on this connection
    /// is dispatched.
    pub async fn prepare(&self, keep_alive: bool, version: u8) {
        let mut state = self.state.lock().await;
        state.framing = Framing::Empty;
        state.committed = false;
        state.keep_alive = keep_alive;
        state.version = version;
    }

    /// Writes a complete, buffered response and flushes it.
    pub async fn send(&self, response: Response) -> io::Result<()> {
        let mut state = self.state.lock().await;
        let keep_alive = state.keep_alive && response.is_keep_alive();
        state.keep_alive = keep_alive;
        state.committed = true;

        let bytes = response.keep_alive(keep_alive).into_bytes();
        let timeout = state.write_timeout;
        timed(timeout, state.io.write_all(&bytes)).await?;
        timed(timeout, state.io.flush()).await
    }

    /// Writes the status line and headers of a streamed response.
    ///
    /// Hop-by-hop fields of `head` are replaced by this connection's own
    /// framing. Trailer names announced by the origin are re-announced when
    /// the client framing can carry trailers.
    pub async fn send_head(&self, head: &ResponseHead, bodiless: bool) -> io::Result<Framing> {
        let mut state = self.state.lock().await;

        let origin_chunked = head
            .headers
            .get_list("transfer-encoding")
            .any(|coding| coding.eq_ignore_ascii_case("chunked"));
        let trailer_names: Vec<String> =
            head.headers.get_list("trailer").map(str::to_owned).collect();

        let mut headers = head.headers.clone();
        headers.strip_hop_by_hop();

        let framing = if bodiless {
            Framing::Empty
        } else if !origin_chunked && headers.contains("content-length") {
            Framing::Length
        } else if state.version >= 1 {
            headers.remove("content-length");
            headers.insert("Transfer-Encoding", "chunked");
            if !trailer_names.is_empty() {
                headers.insert("Trailer", trailer_names.join(", "));
            }
            Framing::Chunked
        } else {
            headers.remove("content-length");
            state.keep_alive = false;
            Framing::Close
        };

        let connection = if state.keep_alive { "keep-alive" } else { "close" };
        headers.set("Connection", connection);

        let mut buf = format!(
            "HTTP/1.1 {} {}\r\n",
            head.status.as_u16(),
            head.status.canonical_reason()
        );
        buf.push_str(&headers.to_string());
        buf.push_str("\r\n");

        state.framing = framing;
        state.committed = true;
        let timeout = state.write_timeout;
        timed(timeout, state.io.write_all(buf.as_bytes())).await?;
        Ok(framing)
    }

    /// Writes one body chunk using the framing chosen by [`send_head`](Self::send_head).
    pub async fn write_body(&self, chunk: &[u8]) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let timeout = state.write_timeout;
        match state.framing {
            Framing::Empty => Ok(()),
            Framing::Length | Framing::Close => timed(timeout, state.io.write_all(chunk)).await,
            Framing::Chunked => {
                let size = format!("{:x}\r\n", chunk.len());
                timed(timeout, state.io.write_all(size.as_bytes())).await?;
                timed(timeout, state.io.write_all(chunk)).await?;
                timed(timeout, state.io.write_all(b"\r\n")).await
            }
        }
    }

    /// Terminates a streamed body, emitting `trailers` when the framing is chunked.
    pub async fn finish(&self, trailers: &Headers) -> io::Result<()> {
        let mut state = self.state.lock().await;
        let timeout = state.write_timeout;
        if state.framing == Framing::Chunked {
            let mut tail = String::from("0\r\n");
            tail.push_str(&trailers.to_string());
            tail.push_str("\r\n");
            timed(timeout, state.io.write_all(tail.as_bytes())).await?;
        }
        timed(timeout, state.io.flush()).await
    }

    /// Pushes buffered bytes to the client.
    pub async fn flush(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        let timeout = state.write_timeout;
        timed(timeout, state.io.flush()).await
    }

    /// Marks the connection as unusable for further requests, e.g. after a
    /// body was cut short.
    pub async fn close_after_response(&self) {
        self.state.lock().await.keep_alive = false;
    }

    /// Returns `true` once a status line has been written for the current request.
    pub async fn is_committed(&self) -> bool {
        self.state.lock().await.committed
    }

    /// Returns `true` if the connection may serve another request.
    pub async fn keep_alive(&self) -> bool {
        self.state.lock().await.keep_alive
    }
}

async fn timed<T>(limit: Duration, fut: impl Future<Output = io::Result<T>>) -> io::Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "client write timed out")),
    }
}
