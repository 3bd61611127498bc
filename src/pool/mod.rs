//! The per-origin connection pool.
//!
//! A pool multiplexes concurrent callers over a bounded set of long-lived
//! connections to a single origin. Connections are created lazily, in the
//! caller's context, up to [`Config::size`]; once the bound is reached,
//! checkouts queue FIFO and are handed connections directly as earlier
//! callers check in.
//!
//! A checked-out connection belongs to the caller until checkin. Checkin
//! re-adopts the connection into the idle set when the codec still reports
//! it open (moving socket ownership back for freshly-dialed connections),
//! and evicts it otherwise. Idle connections are re-validated against the
//! codec's staleness oracle at the next checkout; expired ones are closed
//! and replaced with a fresh dial inside the same checkout call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::conn::{Connection, Dial, DiscardOutcome, Mode};
use crate::error::Error;
use crate::metrics::{registry, MetricsBlock, PoolStatus};
use crate::origin::Origin;
use crate::telemetry;

mod lease;
mod worker;

pub(crate) use self::lease::{Lease, LeaseKind};
use self::worker::Worker;

/// Configuration for a [`Pool`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Client-instance tag; metrics register under `(name, origin)`.
    pub name: String,

    /// Maximum number of concurrent connections to the origin.
    pub size: usize,

    /// Shut the pool down after this long without any checkout or
    /// checkin. `None` keeps the pool alive until [`Pool::close`].
    pub pool_max_idle_time: Option<Duration>,

    /// Whether to register a metrics block for this pool.
    pub metrics: bool,

    /// Replica tag, for origins served by more than one pool.
    pub pool_idx: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            size: 50,
            pool_max_idle_time: None,
            metrics: false,
            pool_idx: 0,
        }
    }
}

impl Config {
    /// Set the client-instance tag.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the connection bound.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Enable or disable the metrics block.
    pub fn with_metrics(mut self, metrics: bool) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set the whole-pool idle shutdown timeout.
    pub fn with_pool_max_idle_time(mut self, max_idle: Duration) -> Self {
        self.pool_max_idle_time = Some(max_idle);
        self
    }
}

/// A pool of connections to a single origin.
///
/// Cheap to clone; clones share the same worker set.
#[derive(Debug)]
pub struct Pool<D: Dial> {
    shared: Arc<PoolShared<D>>,
}

impl<D: Dial> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

pub(crate) struct PoolShared<D: Dial> {
    origin: Origin,
    dialer: D,
    config: Config,
    state: Mutex<PoolState<D::Conn>>,
    metrics: Option<Arc<MetricsBlock>>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
}

impl<D: Dial> std::fmt::Debug for PoolShared<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolShared")
            .field("origin", &self.origin)
            .field("config", &self.config)
            .finish()
    }
}

struct PoolState<C> {
    idle: VecDeque<Worker<C>>,
    created: usize,
    waiters: VecDeque<oneshot::Sender<Reserved<C>>>,
}

/// What a checkout acquired: an idle worker, or permission to dial a new
/// connection in the caller's context.
enum Reserved<C> {
    Idle(Worker<C>),
    Slot,
}

impl<D: Dial> Pool<D> {
    /// Create a pool for `origin`, dialing through `dialer`.
    ///
    /// The pool starts empty; connections are dialed on demand up to
    /// `config.size`. When `config.pool_max_idle_time` is set and a tokio
    /// runtime is available, an idle monitor is spawned that shuts the
    /// pool down after that long without traffic.
    pub fn new(origin: Origin, dialer: D, config: Config) -> Self {
        let metrics = config
            .metrics
            .then(|| registry::init(&config.name, &origin, config.pool_idx, config.size));

        let shared = Arc::new(PoolShared {
            origin,
            dialer,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                created: 0,
                waiters: VecDeque::new(),
            }),
            metrics,
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        });

        if let Some(max_idle) = shared.config.pool_max_idle_time {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(idle_monitor(Arc::downgrade(&shared), max_idle));
            }
        }

        Self { shared }
    }

    /// The origin this pool serves.
    pub fn origin(&self) -> &Origin {
        &self.shared.origin
    }

    /// Whether the pool has shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// This pool's own metrics snapshot, when metrics are enabled.
    pub fn status(&self) -> Option<PoolStatus> {
        self.shared.metrics.as_ref().map(|metrics| metrics.status())
    }

    /// Shut the pool down: queued checkouts fail with
    /// [`Error::PoolClosed`] and every idle connection is closed.
    /// Outstanding leases are evicted as they check in.
    pub async fn close(&self) {
        self.shared.close().await;
    }

    /// Hand an unsolicited codec message to the idle set.
    ///
    /// Workers are probed in idle order: the first to consume the message
    /// ends the dispatch, workers reporting it unknown are left alone, and
    /// a fatal report evicts that worker.
    pub async fn dispatch_idle_message(&self, message: &<D::Conn as Connection>::Message) {
        let fatal = {
            let mut state = self.shared.state.lock();
            let mut fatal = None;
            let mut index = 0;
            while index < state.idle.len() {
                match state.idle[index].discard(message) {
                    DiscardOutcome::Consumed => {
                        trace!(origin = %self.shared.origin, "unsolicited message consumed");
                        return;
                    }
                    DiscardOutcome::Unknown => index += 1,
                    DiscardOutcome::Fatal => {
                        fatal = state.idle.remove(index);
                        break;
                    }
                }
            }
            fatal
        };

        if let Some(worker) = fatal {
            debug!(origin = %self.shared.origin, "fatal message on idle connection; evicting");
            let mut connection = worker.into_connection();
            connection.close().await;
            self.shared.release_slot();
        }
    }

    /// Check a connection out of the pool, waiting at most `pool_timeout`
    /// for one to become available.
    pub(crate) async fn checkout(&self, pool_timeout: Duration) -> Result<Lease<D>, Error> {
        let started = Instant::now();
        let deadline = started + pool_timeout;
        let shared = &self.shared;

        shared.touch();

        let acquired = {
            let mut state = shared.state.lock();
            if shared.is_closed() {
                return Err(Error::PoolClosed {
                    origin: shared.origin.clone(),
                });
            }

            if let Some(worker) = state.idle.pop_front() {
                trace!(origin = %shared.origin, "idle connection found");
                Ok(Reserved::Idle(worker))
            } else if state.created < shared.config.size {
                state.created += 1;
                trace!(origin = %shared.origin, "reserving slot for a fresh dial");
                Ok(Reserved::Slot)
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                trace!(origin = %shared.origin, "pool exhausted, queueing");
                Err(rx)
            }
        };

        let mut reserved = match acquired {
            Ok(reserved) => reserved,
            Err(mut rx) => match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(Ok(reserved)) => reserved,
                Ok(Err(_)) => {
                    return Err(Error::PoolClosed {
                        origin: shared.origin.clone(),
                    })
                }
                Err(_) => {
                    // A worker may have been handed over in the instant the
                    // timeout fired; give it back rather than consume it.
                    match rx.try_recv() {
                        Ok(Reserved::Idle(worker)) => shared.release_worker(worker),
                        Ok(Reserved::Slot) => shared.release_slot(),
                        Err(_) => {}
                    }
                    return Err(Error::PoolTimeout {
                        origin: shared.origin.clone(),
                        elapsed: started.elapsed(),
                    });
                }
            },
        };

        // The slot now belongs to this checkout; the permit gives it back
        // if the caller is dropped mid-dial or the dial fails.
        let mut permit = SlotPermit {
            shared,
            armed: true,
        };

        loop {
            match reserved {
                Reserved::Idle(worker) => {
                    let idle_time = worker.idle_time();
                    let mut connection = worker.into_connection();

                    if connection.is_reusable(idle_time) {
                        if connection.set_mode(Mode::Passive).is_ok() {
                            permit.armed = false;
                            return Ok(self.finish_checkout(
                                connection,
                                LeaseKind::Reuse,
                                idle_time,
                                started,
                            ));
                        }
                        debug!(origin = %shared.origin, "mode switch failed at checkout; evicting");
                    } else {
                        debug!(origin = %shared.origin, ?idle_time, "idle connection expired");
                        telemetry::conn_idle_expired(&shared.origin, idle_time);
                    }

                    connection.close().await;
                    reserved = Reserved::Slot;
                }
                Reserved::Slot => {
                    return match shared.dialer.dial(&shared.origin).await {
                        Ok(connection) => {
                            permit.armed = false;
                            Ok(self.finish_checkout(
                                connection,
                                LeaseKind::Fresh,
                                Duration::ZERO,
                                started,
                            ))
                        }
                        Err(error) => Err(Error::Transport(error.into())),
                    };
                }
            }
        }
    }

    fn finish_checkout(
        &self,
        connection: D::Conn,
        kind: LeaseKind,
        idle_time: Duration,
        started: Instant,
    ) -> Lease<D> {
        let shared = &self.shared;
        if let Some(metrics) = &shared.metrics {
            metrics.incr_in_use();
            metrics.record_checkout(started.elapsed().as_micros() as u64);
        }
        trace!(origin = %shared.origin, ?kind, "connection checked out");
        Lease::new(connection, kind, idle_time, Arc::downgrade(shared))
    }
}

/// Returns a reserved slot to the pool unless disarmed.
struct SlotPermit<'p, D: Dial> {
    shared: &'p Arc<PoolShared<D>>,
    armed: bool,
}

impl<D: Dial> Drop for SlotPermit<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_slot();
        }
    }
}

impl<D: Dial> PoolShared<D> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Hand a worker to the first live waiter, or park it in the idle set.
    fn release_worker(&self, mut worker: Worker<D::Conn>) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(Reserved::Idle(worker)) {
                Ok(()) => {
                    trace!(origin = %self.origin, "worker handed to waiter");
                    return;
                }
                Err(Reserved::Idle(returned)) => {
                    trace!(origin = %self.origin, "skipping closed waiter");
                    worker = returned;
                }
                Err(Reserved::Slot) => unreachable!("waiters are only sent what we put in"),
            }
        }
        state.idle.push_back(worker);
    }

    /// Give a freed slot to the first live waiter, or shrink the pool.
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.created -= 1;
        while let Some(waiter) = state.waiters.pop_front() {
            state.created += 1;
            if waiter.send(Reserved::Slot).is_ok() {
                trace!(origin = %self.origin, "slot handed to waiter");
                return;
            }
            state.created -= 1;
        }
    }

    /// Normal checkin at the end of an exchange. Re-adopts the connection
    /// when the codec still reports it open, evicts otherwise.
    pub(crate) async fn checkin(&self, mut connection: D::Conn, kind: LeaseKind, usage: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.decr_in_use();
            metrics.record_usage(usage.as_micros() as u64);
        }
        self.touch();

        let adopt = !self.is_closed()
            && connection.is_open()
            && (kind == LeaseKind::Reuse || connection.transfer().is_ok())
            && connection.set_mode(Mode::Active).is_ok();

        if adopt {
            self.release_worker(Worker::new(connection));
        } else {
            debug!(origin = %self.origin, "connection not re-adopted at checkin");
            connection.close().await;
            self.release_slot();
        }
    }

    /// Evict a leased connection that finished in an indeterminate state.
    pub(crate) async fn discard_leased(&self, mut connection: D::Conn) {
        if let Some(metrics) = &self.metrics {
            metrics.decr_in_use();
        }
        self.touch();
        connection.close().await;
        self.release_slot();
    }

    /// Evict a leased connection whose lease was dropped without checkin.
    /// Closing happens in the background when a runtime is available.
    pub(crate) fn abandon_leased(&self, mut connection: D::Conn) {
        if let Some(metrics) = &self.metrics {
            metrics.decr_in_use();
        }
        self.touch();
        self.release_slot();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { connection.close().await });
            }
            // No runtime left; the codec's own Drop tears the socket down.
            Err(_) => drop(connection),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(origin = %self.origin, "closing pool");

        let (workers, waiters) = {
            let mut state = self.state.lock();
            let workers: Vec<_> = state.idle.drain(..).collect();
            state.created -= workers.len();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            (workers, waiters)
        };

        // Dropping the senders wakes queued checkouts with PoolClosed.
        drop(waiters);

        for worker in workers {
            let mut connection = worker.into_connection();
            connection.close().await;
        }
    }
}

async fn idle_monitor<D: Dial>(shared: Weak<PoolShared<D>>, max_idle: Duration) {
    loop {
        let deadline = match shared.upgrade() {
            Some(shared) if !shared.is_closed() => *shared.last_activity.lock() + max_idle,
            _ => return,
        };

        tokio::time::sleep_until(deadline).await;

        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.is_closed() {
            return;
        }

        let expired = {
            let state = shared.state.lock();
            let last = *shared.last_activity.lock();
            last.elapsed() >= max_idle && state.idle.len() == state.created
        };

        if expired {
            debug!(origin = %shared.origin, "pool idle for {max_idle:?}; shutting down");
            telemetry::emit(telemetry::Event::PoolMaxIdleTimeExceeded {
                origin: shared.origin.clone(),
            });
            shared.close().await;
            return;
        }
    }
}
