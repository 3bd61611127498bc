//! A codec full of scriptable implementations, suitable for exercising
//! pool behavior without a wire protocol.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use super::{Connection, Dial, DiscardOutcome, Folded, Mode, Request, ResponsePart};
use crate::origin::Origin;

static IDENT: AtomicU16 = AtomicU16::new(1);

/// Identifies a mock connection across dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u16);

impl ConnectionId {
    fn new() -> Self {
        Self(IDENT.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock-conn-{}", self.0)
    }
}

/// Errors produced by the mock codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MockError {
    /// The connection was used after closing.
    #[error("connection closed")]
    Closed,

    /// The dialer was scripted to refuse.
    #[error("dial refused")]
    DialRefused,

    /// The exchange was scripted to break mid-response.
    #[error("exchange interrupted")]
    Interrupted,

    /// Ownership transfer was scripted to fail.
    #[error("ownership transfer refused")]
    TransferRefused,
}

/// Unsolicited messages a mock idle connection can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockMessage {
    /// Belongs to the connection and is absorbed.
    Ping,
    /// Not addressed to the connection.
    Noise,
    /// The peer closed; fatal for the connection.
    PeerClose,
}

/// A scriptable [`Connection`].
///
/// Defaults to a healthy connection answering every exchange with
/// `200 OK` + `"hello"`; builder methods script latency, response parts,
/// mid-exchange failure, staleness and transfer behavior.
#[derive(Debug)]
pub struct MockConnection {
    id: ConnectionId,
    open: Arc<AtomicBool>,
    exchanges: Arc<AtomicUsize>,
    mode: Mode,
    max_idle: Option<Duration>,
    latency: Duration,
    parts: Vec<ResponsePart>,
    fail_after: Option<usize>,
    refuse_transfer: bool,
    single_use: bool,
}

impl MockConnection {
    /// A healthy connection answering `200 OK` with a small body.
    pub fn ok() -> Self {
        Self {
            id: ConnectionId::new(),
            open: Arc::new(AtomicBool::new(true)),
            exchanges: Arc::new(AtomicUsize::new(0)),
            mode: Mode::Passive,
            max_idle: None,
            latency: Duration::ZERO,
            parts: vec![
                ResponsePart::Status(http::StatusCode::OK),
                ResponsePart::Headers(http::HeaderMap::new()),
                ResponsePart::Data(bytes::Bytes::from_static(b"hello")),
                ResponsePart::End,
            ],
            fail_after: None,
            refuse_transfer: false,
            single_use: false,
        }
    }

    /// Take `latency` to produce the first response part of each exchange.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replay `parts` for each exchange instead of the default response.
    pub fn with_parts(mut self, parts: Vec<ResponsePart>) -> Self {
        self.parts = parts;
        self
    }

    /// Report staleness once idle longer than `max_idle`.
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    /// Break the connection after delivering `parts` response parts.
    pub fn failing_after(mut self, parts: usize) -> Self {
        self.fail_after = Some(parts);
        self
    }

    /// Refuse ownership transfer back to the pool.
    pub fn refusing_transfer(mut self) -> Self {
        self.refuse_transfer = true;
        self
    }

    /// Close after one complete exchange, like a `Connection: close`
    /// response.
    pub fn single_use(mut self) -> Self {
        self.single_use = true;
        self
    }

    /// This connection's identity.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The current delivery mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// A handle for observing (and closing) the connection after it has
    /// moved into a pool.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            id: self.id,
            open: self.open.clone(),
            exchanges: self.exchanges.clone(),
        }
    }
}

impl Connection for MockConnection {
    type Message = MockMessage;
    type Error = MockError;

    async fn request<A, F>(
        &mut self,
        _request: &Request,
        mut acc: A,
        mut fold: F,
        _receive_timeout: Duration,
        _idle_time: Duration,
    ) -> Result<Folded<A>, Self::Error>
    where
        A: Send,
        F: FnMut(ResponsePart, A) -> ControlFlow<A, A> + Send,
    {
        if !self.is_open() {
            return Err(MockError::Closed);
        }

        self.exchanges.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        for (index, part) in self.parts.clone().into_iter().enumerate() {
            if self.fail_after == Some(index) {
                self.open.store(false, Ordering::SeqCst);
                return Err(MockError::Interrupted);
            }

            acc = match fold(part, acc) {
                ControlFlow::Continue(acc) => acc,
                ControlFlow::Break(acc) => return Ok(Folded::Halted(acc)),
            };
        }

        if self.single_use {
            self.open.store(false, Ordering::SeqCst);
        }

        Ok(Folded::Complete(acc))
    }

    fn set_mode(&mut self, mode: Mode) -> Result<(), Self::Error> {
        if !self.is_open() {
            return Err(MockError::Closed);
        }
        self.mode = mode;
        Ok(())
    }

    fn is_reusable(&self, idle_time: Duration) -> bool {
        self.is_open() && self.max_idle.map_or(true, |max| idle_time <= max)
    }

    fn discard(&mut self, message: &Self::Message) -> DiscardOutcome {
        match message {
            MockMessage::Ping => DiscardOutcome::Consumed,
            MockMessage::Noise => DiscardOutcome::Unknown,
            MockMessage::PeerClose => {
                self.open.store(false, Ordering::SeqCst);
                DiscardOutcome::Fatal
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn transfer(&mut self) -> Result<(), Self::Error> {
        if self.refuse_transfer {
            Err(MockError::TransferRefused)
        } else {
            Ok(())
        }
    }

    async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Observer handle to a [`MockConnection`] that has moved elsewhere.
#[derive(Debug, Clone)]
pub struct MockHandle {
    id: ConnectionId,
    open: Arc<AtomicBool>,
    exchanges: Arc<AtomicUsize>,
}

impl MockHandle {
    /// The observed connection's identity.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the connection out from under its owner, simulating a peer
    /// half-close while idle.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// How many exchanges the connection has served.
    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}

type MakeFn = dyn Fn(usize) -> Result<MockConnection, MockError> + Send + Sync;

/// A scriptable [`Dial`] implementation.
#[derive(Clone)]
pub struct MockDialer {
    make: Arc<MakeFn>,
    delays: Arc<Vec<Duration>>,
    dialed: Arc<AtomicUsize>,
}

impl fmt::Debug for MockDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDialer")
            .field("dialed", &self.dialed())
            .finish()
    }
}

impl MockDialer {
    /// Dialer producing healthy [`MockConnection::ok`] connections.
    pub fn ok() -> Self {
        Self::from_fn(|_| Ok(MockConnection::ok()))
    }

    /// Dialer producing whatever `make` returns; `make` receives the
    /// zero-based dial count.
    pub fn from_fn(
        make: impl Fn(usize) -> Result<MockConnection, MockError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            make: Arc::new(make),
            delays: Arc::new(Vec::new()),
            dialed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Dialer refusing every dial.
    pub fn error() -> Self {
        Self::from_fn(|_| Err(MockError::DialRefused))
    }

    /// Per-dial connect latency; the last entry repeats for later dials.
    pub fn with_dial_delays(mut self, delays: Vec<Duration>) -> Self {
        self.delays = Arc::new(delays);
        self
    }

    /// How many dials have been attempted.
    pub fn dialed(&self) -> usize {
        self.dialed.load(Ordering::SeqCst)
    }
}

impl Dial for MockDialer {
    type Conn = MockConnection;

    async fn dial(&self, origin: &Origin) -> Result<Self::Conn, MockError> {
        let attempt = self.dialed.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(attempt).or_else(|| self.delays.last()) {
            tokio::time::sleep(*delay).await;
        }
        trace!(%origin, attempt, "mock dial");
        (self.make)(attempt)
    }
}
