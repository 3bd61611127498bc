use std::time::Duration;

use thiserror::Error;

use crate::origin::Origin;
use crate::BoxError;

/// Errors surfaced to callers of a pool.
///
/// Worker-internal failures (idle expiry, eviction) are absorbed by the
/// pool and emitted as [telemetry](crate::telemetry) instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No connection could be checked out within the pool timeout.
    #[error(
        "checkout from the pool for {origin} timed out after {elapsed:?}; \
         the pool may be undersized for this workload, consider raising the \
         pool size or the pool timeout"
    )]
    PoolTimeout {
        /// Origin of the pool that timed out.
        origin: Origin,
        /// How long the caller waited.
        elapsed: Duration,
    },

    /// The pool has shut down and accepts no further checkouts.
    #[error("the pool for {origin} is closed")]
    PoolClosed {
        /// Origin of the closed pool.
        origin: Origin,
    },

    /// The codec reported a failure while dialing or mid-exchange.
    #[error("transport: {0}")]
    Transport(#[source] BoxError),

    /// No metrics are registered for this `(name, origin)` pair.
    #[error("no pool metrics registered for {origin} under {name:?}")]
    MetricsNotFound {
        /// Registry name the lookup used.
        name: String,
        /// Origin the lookup used.
        origin: Origin,
    },

    /// A metrics reset could not quiesce in-flight writers before its
    /// deadline. Timing counters may be mutually inconsistent afterwards.
    #[error("metrics reset timed out after {waited:?} waiting for writers to drain")]
    ResetTimeout {
        /// The deadline that elapsed.
        waited: Duration,
    },
}

impl Error {
    /// Returns `true` for checkout-timeout errors.
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self, Error::PoolTimeout { .. })
    }
}
