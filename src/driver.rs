//! Thin request orchestration over pool checkout.
//!
//! [`Pool::request`] drives one synchronous exchange: checkout, fold the
//! response parts into the caller's accumulator, checkin.
//! [`Pool::async_request`] runs the same exchange on a spawned driver task
//! and streams each part to the caller over a channel, with cancellation
//! observable between every part.

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt as _;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::conn::{Connection, Dial, Folded, Request, ResponsePart};
use crate::error::Error;
use crate::origin::Origin;
use crate::pool::Pool;
use crate::telemetry::{self, Event};

/// Per-request options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Bound on waiting for a connection checkout.
    pub pool_timeout: Duration,

    /// Bound on each codec receive during the exchange. A receive that
    /// exceeds it breaks the connection, which is then evicted at checkin.
    pub receive_timeout: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            pool_timeout: Duration::from_millis(5_000),
            receive_timeout: Duration::from_millis(15_000),
        }
    }
}

impl RequestOptions {
    /// Set the checkout bound.
    pub fn with_pool_timeout(mut self, pool_timeout: Duration) -> Self {
        self.pool_timeout = pool_timeout;
        self
    }

    /// Set the per-receive bound.
    pub fn with_receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }
}

impl<D: Dial> Pool<D> {
    /// Execute one request, folding the streamed response into `acc`.
    ///
    /// `fold` observes every response part in protocol order exactly once
    /// and returns the new accumulator; [`ControlFlow::Break`] halts the
    /// exchange early (the connection is then evicted, since unread parts
    /// may remain on the wire).
    ///
    /// Checkout waits at most `options.pool_timeout` and surfaces
    /// [`Error::PoolTimeout`] on expiry; codec failures surface as
    /// [`Error::Transport`] with the connection evicted when the codec
    /// reports it broken. Panics inside the exchange are recorded as
    /// `queue.exception` telemetry, evict the connection, and resume.
    pub async fn request<A, F>(
        &self,
        request: &Request,
        acc: A,
        fold: F,
        options: RequestOptions,
    ) -> Result<A, Error>
    where
        A: Send,
        F: FnMut(ResponsePart, A) -> ControlFlow<A, A> + Send,
    {
        telemetry::emit(Event::QueueStart {
            origin: self.origin().clone(),
            method: request.method().clone(),
            path: request.path().to_owned(),
        });

        let mut lease = match self.checkout(options.pool_timeout).await {
            Ok(lease) => lease,
            Err(error) => {
                telemetry::emit(Event::QueueException {
                    origin: self.origin().clone(),
                    kind: "checkout",
                    message: error.to_string(),
                });
                return Err(error);
            }
        };

        let idle_time = lease.idle_time();
        telemetry::emit(Event::QueueStop {
            origin: self.origin().clone(),
            method: request.method().clone(),
            path: request.path().to_owned(),
            idle_time,
        });

        trace!(origin = %self.origin(), kind = ?lease.kind(), "driving exchange");
        let outcome = AssertUnwindSafe(lease.request(
            request,
            acc,
            fold,
            options.receive_timeout,
            idle_time,
        ))
        .catch_unwind()
        .await;

        match outcome {
            Ok(Ok(Folded::Complete(acc))) => {
                lease.checkin().await;
                Ok(acc)
            }
            Ok(Ok(Folded::Halted(acc))) => {
                debug!(origin = %self.origin(), "fold halted early; discarding connection");
                lease.discard().await;
                Ok(acc)
            }
            Ok(Err(error)) => {
                // Checkin consults the codec: a broken connection is
                // evicted, one that is still open goes back to the pool.
                lease.checkin().await;
                Err(Error::Transport(error.into()))
            }
            Err(panic) => {
                telemetry::emit(Event::QueueException {
                    origin: self.origin().clone(),
                    kind: "panic",
                    message: panic_message(panic.as_ref()),
                });
                drop(lease);
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Execute a request on a spawned driver task, streaming each response
    /// part to the returned receiver.
    ///
    /// The stream ends with [`AsyncResponse::Done`] or
    /// [`AsyncResponse::Error`]. Dropping the receiver cancels delivery:
    /// the driver polls for caller death before every part and unwinds,
    /// returning the connection through the normal checkin path (evicted
    /// when mid-stream). [`RequestToken::cancel`] force-terminates the
    /// driver instead.
    pub fn async_request(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> (RequestToken, mpsc::UnboundedReceiver<AsyncResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let errors = tx.clone();
        let pool = self.clone();

        let task = tokio::spawn(async move {
            let fold = |part, tx: mpsc::UnboundedSender<AsyncResponse>| {
                if tx.is_closed() {
                    trace!("async caller went away; halting fold");
                    return ControlFlow::Break(tx);
                }
                match tx.send(AsyncResponse::Part(part)) {
                    Ok(()) => ControlFlow::Continue(tx),
                    // The caller vanished between the poll and the send.
                    Err(_) => ControlFlow::Break(tx),
                }
            };

            match pool.request(&request, tx, fold, options).await {
                Ok(tx) => {
                    let _ = tx.send(AsyncResponse::Done);
                }
                Err(error) => {
                    let _ = errors.send(AsyncResponse::Error(error));
                }
            }
        });

        let token = RequestToken {
            origin: self.origin().clone(),
            abort: task.abort_handle(),
        };
        (token, rx)
    }
}

/// One message of a streaming response.
#[derive(Debug)]
pub enum AsyncResponse {
    /// The next response part, in protocol order.
    Part(ResponsePart),
    /// The exchange completed; no further messages follow.
    Done,
    /// The exchange failed; no further messages follow.
    Error(Error),
}

/// Cancellation handle for a streaming request.
#[derive(Debug)]
pub struct RequestToken {
    origin: Origin,
    abort: AbortHandle,
}

impl RequestToken {
    /// The origin the request was issued against.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Force-terminate the driver task.
    ///
    /// An in-flight connection unwinds through the lease and is evicted;
    /// the caller receives no further messages. Cancelling an already
    /// finished request is a no-op.
    pub fn cancel(self) {
        trace!(origin = %self.origin, "cancelling async request");
        self.abort.abort();
    }
}

/// Cancel a streaming request issued with [`Pool::async_request`].
pub fn cancel_async_request(token: RequestToken) {
    token.cancel();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}
