//! Outbound HTTP/1.1 client used to reach the origin server.
//!
//! Every forwarded request gets its own connection, sent with
//! `Connection: close`. The response head is parsed with [`httparse`]; the
//! body is handed back undecoded as a [`Body`] so the proxy can stream it.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::http::{Headers, Method, Request, ResponseHead, StatusCode};

pub mod body;

pub use body::{Body, BodyKind};

/// Maximum number of headers accepted in an origin response.
const MAX_HEADERS: usize = 64;

/// Largest origin response head we will buffer.
const MAX_HEAD_SIZE: usize = 64 * 1024;

const DEFAULT_PORT: u16 = 80;

/// Errors raised while talking to the origin. The proxy treats every variant
/// as a transport failure.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("origin did not respond within {0:?}")]
    Timeout(Duration),

    #[error("I/O error talking to origin: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse origin response: {0}")]
    Parse(#[from] httparse::Error),

    #[error("origin closed the connection before the response was complete")]
    Incomplete,

    #[error("unsupported backend scheme: {0}")]
    UnsupportedScheme(String),

    #[error("malformed origin response: {0}")]
    Malformed(&'static str),
}

/// An origin response whose head has been read and whose body is pending.
pub struct UpstreamResponse {
    pub head: ResponseHead,
    pub body: Body<TcpStream>,
}

/// The configured origin server.
#[derive(Debug, Clone)]
pub struct Upstream {
    scheme: String,
    authority: String,
    addr: String,
    timeout: Duration,
}

impl Upstream {
    /// `host` is `name`, `name:port` or `:port` (the latter meaning this
    /// machine). `timeout` bounds connecting plus receiving the response
    /// head, and every later body read.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::UnsupportedScheme`] for anything but `http`.
    pub fn new(scheme: &str, host: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        if !scheme.eq_ignore_ascii_case("http") {
            return Err(UpstreamError::UnsupportedScheme(scheme.to_owned()));
        }

        let authority = match host.strip_prefix(':') {
            Some(port) => format!("localhost:{port}"),
            None => host.to_owned(),
        };
        let addr = match host.strip_prefix(':') {
            Some(port) => format!("127.0.0.1:{port}"),
            None if has_port(host) => host.to_owned(),
            None => format!("{host}:{DEFAULT_PORT}"),
        };

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            authority,
            addr,
            timeout,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Value sent as `Host` to the origin.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Socket address the client connects to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends `request` to the origin and reads the response head.
    ///
    /// # Errors
    ///
    /// Any [`UpstreamError`]; nothing has been written to the client yet when
    /// this fails, so the caller is free to answer some other way.
    pub async fn send(&self, request: &Request) -> Result<UpstreamResponse, UpstreamError> {
        match tokio::time::timeout(self.timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        }
    }

    async fn exchange(&self, request: &Request) -> Result<UpstreamResponse, UpstreamError> {
        let mut stream =
            TcpStream::connect(&self.addr)
                .await
                .map_err(|source| UpstreamError::Connect {
                    addr: self.addr.clone(),
                    source,
                })?;
        let _ = stream.set_nodelay(true);

        let mut outbound = request.clone();
        let headers = outbound.headers_mut();
        headers.set("Connection", "close");
        if !request.body().is_empty() {
            headers.set("Content-Length", request.body().len().to_string());
        }
        stream.write_all(&outbound.to_bytes()).await?;
        debug!(addr = %self.addr, method = %request.method(), url = %request.url(), "request sent to origin");

        let mut buf = BytesMut::with_capacity(4096);
        loop {
            if let Some((head, head_len)) = parse_head(&buf)? {
                let _ = buf.split_to(head_len);
                // interim responses carry no body; the final head follows
                if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                    debug!(status = head.status.as_u16(), "skipping interim response");
                    continue;
                }
                return response_with_body(request, head, stream, buf, self.timeout);
            }
            if buf.len() > MAX_HEAD_SIZE {
                return Err(UpstreamError::Malformed("response head too large"));
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(UpstreamError::Incomplete);
            }
        }
    }
}

fn response_with_body(
    request: &Request,
    head: ResponseHead,
    stream: TcpStream,
    buf: BytesMut,
    timeout: Duration,
) -> Result<UpstreamResponse, UpstreamError> {
    let kind = body_kind(request.method(), head.status, &head.headers)?;
    debug!(status = head.status.as_u16(), ?kind, "origin response head received");
    Ok(UpstreamResponse {
        head,
        body: Body::new(stream, buf, kind, timeout),
    })
}

/// Parses a complete response head from the front of `buf`, returning it
/// with its length in bytes, or `None` if more data is needed.
fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, UpstreamError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut storage);

    let head_len = match response.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };
    let code = response
        .code
        .ok_or(UpstreamError::Malformed("missing status code"))?;

    let mut headers = Headers::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        match std::str::from_utf8(header.value) {
            Ok(value) => headers.insert(header.name, value),
            Err(_) => debug!(name = header.name, "dropping origin header with non UTF-8 value"),
        }
    }

    Ok(Some((
        ResponseHead::new(StatusCode::from_u16(code), headers),
        head_len,
    )))
}

/// Works out how the origin delimits the body of a response to `method`.
pub fn body_kind(
    method: &Method,
    status: StatusCode,
    headers: &Headers,
) -> Result<BodyKind, UpstreamError> {
    if *method == Method::Head || status.is_bodiless() {
        return Ok(BodyKind::Empty);
    }
    if headers
        .get_list("transfer-encoding")
        .last()
        .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"))
    {
        return Ok(BodyKind::Chunked);
    }
    match headers.get("content-length") {
        Some(value) => value
            .trim()
            .parse()
            .map(BodyKind::Length)
            .map_err(|_| UpstreamError::Malformed("invalid Content-Length")),
        None => Ok(BodyKind::Close),
    }
}

fn has_port(host: &str) -> bool {
    match host.rsplit_once(':') {
        Some((name, port)) => {
            port.parse::<u16>().is_ok() && (!name.contains(':') || name.ends_with(']'))
        }
        None => false,
    }
}
