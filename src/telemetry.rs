//! Structured events emitted by pools and the request driver.
//!
//! Events are fanned out to every attached handler and mirrored as
//! `tracing` records. Handlers are process-wide: attach one with
//! [`attach`] and keep the returned [`Subscription`] alive for as long as
//! the handler should observe events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::origin::Origin;

/// A telemetry event.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    /// A request is about to wait for a connection checkout.
    QueueStart {
        /// Origin of the pool being queued on.
        origin: Origin,
        /// Request method.
        method: http::Method,
        /// Request path.
        path: String,
    },

    /// A connection was checked out for a request.
    QueueStop {
        /// Origin of the pool.
        origin: Origin,
        /// Request method.
        method: http::Method,
        /// Request path.
        path: String,
        /// How long the leased connection had been idle.
        idle_time: Duration,
    },

    /// The checkout or exchange failed abnormally.
    QueueException {
        /// Origin of the pool.
        origin: Origin,
        /// Failure class, e.g. `"checkout"` or `"panic"`.
        kind: &'static str,
        /// Human-readable failure detail.
        message: String,
    },

    /// An idle connection exceeded its maximum idle time and was closed
    /// instead of being handed out.
    ConnMaxIdleTimeExceeded {
        /// Origin of the pool.
        origin: Origin,
        /// How long the connection had been idle.
        idle_time: Duration,
    },

    /// Alias of [`Event::ConnMaxIdleTimeExceeded`] kept for one release of
    /// overlap; both events fire for every expiry.
    #[deprecated(note = "match on `ConnMaxIdleTimeExceeded` instead")]
    MaxIdleTimeExceeded {
        /// Origin of the pool.
        origin: Origin,
        /// How long the connection had been idle.
        idle_time: Duration,
    },

    /// The whole pool saw no activity within its maximum idle time and is
    /// shutting down.
    PoolMaxIdleTimeExceeded {
        /// Origin of the pool.
        origin: Origin,
    },
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static HANDLERS: Lazy<RwLock<Vec<(u64, Handler)>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Attach a process-wide event handler.
///
/// The handler runs inline on the emitting task; keep it cheap. Dropping
/// the returned [`Subscription`] detaches it.
pub fn attach(handler: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    HANDLERS.write().push((id, Arc::new(handler)));
    Subscription { id }
}

/// Detaches its handler on drop.
#[derive(Debug)]
#[must_use = "dropping the subscription detaches the handler"]
pub struct Subscription {
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        HANDLERS.write().retain(|(id, _)| *id != self.id);
    }
}

pub(crate) fn emit(event: Event) {
    match &event {
        Event::QueueStart { .. } | Event::QueueStop { .. } => trace!(?event, "telemetry"),
        _ => debug!(?event, "telemetry"),
    }

    let handlers = HANDLERS.read();
    for (_, handler) in handlers.iter() {
        handler(&event);
    }
}

/// Emit both the current and the deprecated idle-expiry event.
pub(crate) fn conn_idle_expired(origin: &Origin, idle_time: Duration) {
    emit(Event::ConnMaxIdleTimeExceeded {
        origin: origin.clone(),
        idle_time,
    });
    #[allow(deprecated)]
    emit(Event::MaxIdleTimeExceeded {
        origin: origin.clone(),
        idle_time,
    });
}
