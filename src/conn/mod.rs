//! Codec-facing contracts.
//!
//! The HTTP/1 wire codec lives outside this crate; the pool reaches it only
//! through the [`Connection`] and [`Dial`] traits here. A connection is
//! owned by exactly one party at a time: the pool's idle slot, or the
//! caller for the duration of a single exchange. While idle a connection is
//! [`Mode::Active`] (it may receive codec events); during an exchange it is
//! [`Mode::Passive`] (the caller pulls response parts through the fold).

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use bytes::Bytes;

use crate::origin::Origin;

pub mod mock;

/// Delivery mode of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The connection pushes events to its current owner. Idle connections
    /// are active so the pool can observe unsolicited codec messages.
    Active,
    /// The current owner pulls response parts on demand. Leased
    /// connections are passive.
    Passive,
}

/// One part of a streamed HTTP/1 response, delivered to the caller's fold
/// in protocol order.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ResponsePart {
    /// The response status line.
    Status(http::StatusCode),
    /// The response header block.
    Headers(http::HeaderMap),
    /// A chunk of the response body.
    Data(Bytes),
    /// Trailing headers, when the body was chunk-encoded with trailers.
    Trailers(http::HeaderMap),
    /// End of the response.
    End,
}

/// How an exchange's fold finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Folded<A> {
    /// The fold observed every response part through [`ResponsePart::End`].
    Complete(A),
    /// The fold halted early. Unread protocol state may remain on the
    /// wire, so the connection must not be returned to the idle set.
    Halted(A),
}

impl<A> Folded<A> {
    /// The final accumulator, regardless of how the fold finished.
    pub fn into_inner(self) -> A {
        match self {
            Folded::Complete(acc) | Folded::Halted(acc) => acc,
        }
    }
}

/// Outcome of handing an unsolicited codec message to an idle connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardOutcome {
    /// The message belonged to this connection and was absorbed.
    Consumed,
    /// The message does not concern this connection.
    Unknown,
    /// The message signals a fatal condition; the connection must be
    /// evicted.
    Fatal,
}

/// A request submitted to a pool.
///
/// Only the pieces the pool and codec need; HTTP semantics (redirects,
/// authentication) are a caller concern.
#[derive(Debug, Clone)]
pub struct Request {
    method: http::Method,
    path: String,
    headers: http::HeaderMap,
    body: Option<Bytes>,
}

impl Request {
    /// Create a request with the given method and path.
    pub fn new(method: http::Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: http::HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request for the given path.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(http::Method::GET, path)
    }

    /// Append a header.
    pub fn with_header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Attach a body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// The request method.
    pub fn method(&self) -> &http::Method {
        &self.method
    }

    /// The request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The request headers.
    pub fn headers(&self) -> &http::HeaderMap {
        &self.headers
    }

    /// The request body, if any.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}

/// An established HTTP/1 connection, as the pool sees it.
///
/// Implementations wrap a wire codec. The pool never inspects bytes; it
/// only sequences ownership, liveness and mode around [`Connection::request`].
pub trait Connection: Send + Sized + 'static {
    /// Unsolicited codec event delivered to an idle connection.
    type Message: Send + 'static;

    /// Error reported by the codec.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Drive one request/response exchange.
    ///
    /// `fold` is invoked for each response part in protocol order and
    /// returns the new accumulator; [`ControlFlow::Break`] halts the
    /// exchange early. `receive_timeout` bounds each codec receive.
    /// `idle_time` reports how long the connection sat idle before this
    /// exchange, for codecs that factor staleness into retry decisions.
    fn request<A, F>(
        &mut self,
        request: &Request,
        acc: A,
        fold: F,
        receive_timeout: Duration,
        idle_time: Duration,
    ) -> impl Future<Output = Result<Folded<A>, Self::Error>> + Send
    where
        A: Send,
        F: FnMut(ResponsePart, A) -> ControlFlow<A, A> + Send;

    /// Switch the delivery mode.
    fn set_mode(&mut self, mode: Mode) -> Result<(), Self::Error>;

    /// Authoritative staleness oracle: whether the connection may serve
    /// another exchange after sitting idle for `idle_time`. Must consider
    /// the connection's own maximum idle time plus protocol-level signals
    /// such as a peer half-close.
    fn is_reusable(&self, idle_time: Duration) -> bool;

    /// Handle an unsolicited codec message received while idle.
    fn discard(&mut self, message: &Self::Message) -> DiscardOutcome;

    /// Whether the connection is open.
    fn is_open(&self) -> bool;

    /// Move ownership of the underlying socket back to the pool after a
    /// freshly-dialed exchange. Implementations without task-owned sockets
    /// may make this a no-op, but idle I/O events must subsequently route
    /// to the pool rather than the last caller.
    fn transfer(&mut self) -> Result<(), Self::Error>;

    /// Close the connection. Idempotent; tolerant of already-closed and
    /// non-owned sockets.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Dials new connections to an origin.
///
/// Codec options travel with the dialer: configure it once, before the
/// pool sees it, and every dialed connection inherits that configuration.
pub trait Dial: Send + Sync + 'static {
    /// The connection type produced by this dialer.
    type Conn: Connection;

    /// Establish a new connection to `origin`.
    ///
    /// Runs in the caller's context so a slow dial never blocks the pool's
    /// scheduler; the dialer's own connect timeout governs it.
    fn dial(
        &self,
        origin: &Origin,
    ) -> impl Future<Output = Result<Self::Conn, <Self::Conn as Connection>::Error>> + Send;
}
