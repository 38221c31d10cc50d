//! Per-request context handed to the middleware pipeline.
//!
//! A [`Context`] bundles the parsed request, the peer address it came from
//! and the [`ResponseWriter`] the response must be written to.

use std::net::SocketAddr;

use crate::Request;
use crate::server::ResponseWriter;

/// Per-request context.
pub struct Context {
    request: Request,
    peer_addr: SocketAddr,
    writer: ResponseWriter,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request, peer_addr: SocketAddr, writer: ResponseWriter) -> Self {
        Self {
            request,
            peer_addr,
            writer,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// Address of the client that sent the request.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn writer(&self) -> &ResponseWriter {
        &self.writer
    }

    /// Splits the context into its owned parts.
    pub fn into_parts(self) -> (Request, SocketAddr, ResponseWriter) {
        (self.request, self.peer_addr, self.writer)
    }
}
