//! Livery
//!
//! A per-origin HTTP/1 connection pool: callers submit a request and a fold
//! function, the pool leases an idle (or freshly dialed) connection, drives
//! the exchange with deadlines, and returns the connection to the idle set
//! when it is still usable.
//!
//! The wire codec is not part of this crate. It is reached exclusively
//! through the [`Connection`] and [`Dial`] traits in [`conn`], which keeps
//! the pool usable with any HTTP/1 implementation (and makes it trivially
//! testable, see [`conn::mock`]).
//!
//! Each pool may carry a [lock-free metrics block](metrics) registered in a
//! process-wide directory, so operational dashboards can read pool health
//! without ever blocking the request hot path.

pub mod conn;
mod driver;
mod error;
pub mod metrics;
mod origin;
pub mod pool;
pub mod telemetry;

pub use self::conn::{Connection, Dial, DiscardOutcome, Folded, Mode, Request, ResponsePart};
pub use self::driver::{cancel_async_request, AsyncResponse, RequestOptions, RequestToken};
pub use self::error::Error;
pub use self::metrics::registry::{pool_status, reset_metrics};
pub use self::metrics::PoolStatus;
pub use self::origin::{Origin, OriginError, Scheme};
pub use self::pool::{Config, Pool};

/// Boxed error type used at trait object boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
