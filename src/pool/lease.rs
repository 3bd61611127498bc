use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Weak;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::PoolShared;
use crate::conn::Dial;

/// How a checkout was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaseKind {
    /// The connection was dialed for this checkout, in the caller's
    /// context; checkin must transfer socket ownership back to the pool.
    Fresh,
    /// The connection came from the idle set; ownership never left the
    /// pool.
    Reuse,
}

/// A connection checked out of a pool.
///
/// The connection logically belongs to the caller for the duration of one
/// exchange. The driver returns it with [`Lease::checkin`] (re-adopt when
/// still open) or [`Lease::discard`] (evict); a lease dropped without
/// either — a panic, or an aborted async driver — evicts, closing the
/// connection in the background.
pub(crate) struct Lease<D: Dial> {
    connection: Option<D::Conn>,
    kind: LeaseKind,
    idle_time: Duration,
    checked_out_at: Instant,
    pool: Weak<PoolShared<D>>,
}

impl<D: Dial> Lease<D> {
    pub(crate) fn new(
        connection: D::Conn,
        kind: LeaseKind,
        idle_time: Duration,
        pool: Weak<PoolShared<D>>,
    ) -> Self {
        Self {
            connection: Some(connection),
            kind,
            idle_time,
            checked_out_at: Instant::now(),
            pool,
        }
    }

    pub(crate) fn kind(&self) -> LeaseKind {
        self.kind
    }

    /// How long the connection had sat idle before this checkout; zero for
    /// fresh dials.
    pub(crate) fn idle_time(&self) -> Duration {
        self.idle_time
    }

    /// Return the connection through the normal checkin path.
    pub(crate) async fn checkin(mut self) {
        let connection = self
            .connection
            .take()
            .expect("connection only taken on checkin or drop");
        let usage = self.checked_out_at.elapsed();

        if let Some(pool) = self.pool.upgrade() {
            pool.checkin(connection, self.kind, usage).await;
        }
    }

    /// Evict the connection: it finished in an indeterminate state (for
    /// example a halted fold left unread parts on the wire).
    pub(crate) async fn discard(mut self) {
        let connection = self
            .connection
            .take()
            .expect("connection only taken on checkin or drop");

        if let Some(pool) = self.pool.upgrade() {
            pool.discard_leased(connection).await;
        }
    }
}

impl<D: Dial> fmt::Debug for Lease<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("kind", &self.kind)
            .field("idle_time", &self.idle_time)
            .finish()
    }
}

impl<D: Dial> Deref for Lease<D> {
    type Target = D::Conn;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("connection only taken on checkin or drop")
    }
}

impl<D: Dial> DerefMut for Lease<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("connection only taken on checkin or drop")
    }
}

impl<D: Dial> Drop for Lease<D> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Some(pool) = self.pool.upgrade() {
                trace!("lease dropped without checkin; evicting");
                pool.abandon_leased(connection);
            }
        }
    }
}
