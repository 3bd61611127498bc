use std::time::Duration;

use tokio::time::Instant;

use crate::conn::{Connection, DiscardOutcome};

/// One slot of the pool's idle set: a connection plus the moment it was
/// last checked in.
#[derive(Debug)]
pub(crate) struct Worker<C> {
    connection: C,
    last_checkin: Instant,
}

impl<C: Connection> Worker<C> {
    /// Wrap a connection that was just checked in (or freshly adopted).
    pub(crate) fn new(connection: C) -> Self {
        Self {
            connection,
            last_checkin: Instant::now(),
        }
    }

    /// Monotonic elapsed time since the last checkin.
    pub(crate) fn idle_time(&self) -> Duration {
        self.last_checkin.elapsed()
    }

    /// Hand an unsolicited codec message to the idle connection.
    pub(crate) fn discard(&mut self, message: &C::Message) -> DiscardOutcome {
        self.connection.discard(message)
    }

    /// Give up the slot, yielding the connection for checkout or closing.
    pub(crate) fn into_connection(self) -> C {
        self.connection
    }
}
