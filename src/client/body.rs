//! Origin response body decoding.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::UpstreamError;
use crate::http::Headers;

/// Longest chunk-size or trailer line accepted from an origin.
const MAX_LINE: usize = 8 * 1024;

/// How the origin delimits its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body (HEAD replies, 1xx, 204, 304).
    Empty,
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// The body runs until the origin closes the connection.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailers,
    Close,
    Done,
}

/// Incremental reader over an origin body.
///
/// Yields the decoded payload one piece at a time through
/// [`next_chunk`](Self::next_chunk). Chunked trailers are collected as they
/// are read and exposed by [`trailers`](Self::trailers) once the body is done.
pub struct Body<R> {
    io: R,
    buf: BytesMut,
    state: State,
    trailers: Headers,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> Body<R> {
    /// `buf` holds whatever followed the response head in the last read.
    pub fn new(io: R, buf: BytesMut, kind: BodyKind, read_timeout: Duration) -> Self {
        let state = match kind {
            BodyKind::Empty => State::Done,
            BodyKind::Length(0) => State::Done,
            BodyKind::Length(n) => State::Length(n),
            BodyKind::Chunked => State::ChunkSize,
            BodyKind::Close => State::Close,
        };
        Self {
            io,
            buf,
            state,
            trailers: Headers::new(),
            read_timeout,
        }
    }

    /// Returns the next piece of the decoded body, or `None` once the body
    /// is complete.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Incomplete`] if the origin hangs up early,
    /// [`UpstreamError::Malformed`] on broken chunk framing, and
    /// [`UpstreamError::Timeout`] / [`UpstreamError::Io`] from the socket.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, UpstreamError> {
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::Length(remaining) => {
                    if self.buf.is_empty() && self.fill().await? == 0 {
                        return Err(UpstreamError::Incomplete);
                    }
                    let piece = self.take(remaining);
                    let left = remaining - piece.len() as u64;
                    self.state = if left == 0 { State::Done } else { State::Length(left) };
                    return Ok(Some(piece));
                }
                State::Close => {
                    if self.buf.is_empty() && self.fill().await? == 0 {
                        self.state = State::Done;
                        return Ok(None);
                    }
                    return Ok(Some(self.buf.split().freeze()));
                }
                State::ChunkSize => {
                    let line = self.read_line().await?;
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 { State::Trailers } else { State::ChunkData(size) };
                }
                State::ChunkData(remaining) => {
                    if self.buf.is_empty() && self.fill().await? == 0 {
                        return Err(UpstreamError::Incomplete);
                    }
                    let piece = self.take(remaining);
                    let left = remaining - piece.len() as u64;
                    self.state = if left == 0 { State::ChunkEnd } else { State::ChunkData(left) };
                    return Ok(Some(piece));
                }
                State::ChunkEnd => {
                    let line = self.read_line().await?;
                    if !line.is_empty() {
                        return Err(UpstreamError::Malformed("chunk data overruns its size"));
                    }
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let line = self.read_line().await?;
                    if line.is_empty() {
                        self.state = State::Done;
                        continue;
                    }
                    let line = std::str::from_utf8(&line)
                        .map_err(|_| UpstreamError::Malformed("trailer is not valid UTF-8"))?;
                    let (name, value) = line
                        .split_once(':')
                        .ok_or(UpstreamError::Malformed("trailer without a colon"))?;
                    self.trailers.insert(name.trim(), value.trim());
                }
            }
        }
    }

    /// Trailer fields received after a chunked body.
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }

    /// Returns `true` once the whole body has been read.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    fn take(&mut self, limit: u64) -> Bytes {
        let n = usize::try_from(limit).map_or(self.buf.len(), |limit| limit.min(self.buf.len()));
        self.buf.split_to(n).freeze()
    }

    /// Reads one CRLF-terminated line, returned without its terminator.
    async fn read_line(&mut self) -> Result<BytesMut, UpstreamError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let mut line = self.buf.split_to(pos + 2);
                line.truncate(pos);
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE {
                return Err(UpstreamError::Malformed("chunk line too long"));
            }
            if self.fill().await? == 0 {
                return Err(UpstreamError::Incomplete);
            }
        }
    }

    async fn fill(&mut self) -> Result<usize, UpstreamError> {
        match tokio::time::timeout(self.read_timeout, self.io.read_buf(&mut self.buf)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(UpstreamError::Timeout(self.read_timeout)),
        }
    }
}

/// Parses `1a;ext=val` into `0x1a`.
fn parse_chunk_size(line: &[u8]) -> Result<u64, UpstreamError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| UpstreamError::Malformed("chunk size is not valid UTF-8"))?;
    let size = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| UpstreamError::Malformed("invalid chunk size"))
}
