//! Lock-free pool metrics.
//!
//! Each pool owns a [`MetricsBlock`]: a fixed slab of 64-bit atomic
//! counters updated on the request hot path and read by operational
//! tooling without ever blocking writers.
//!
//! Resetting is the subtle part. The timing counters come in mutually
//! dependent pairs (a count plus a total), which cannot be zeroed with a
//! single compare-and-swap. Writers of the timing set therefore pass
//! through a two-counter gate: observe `reset_lock`, and while it is clear
//! announce themselves in `reset_lock_queue` for the duration of the
//! update. A reset raises the lock, waits for the queue to drain, zeroes
//! the whole timing set, and lowers the lock. Timing updates that arrive
//! while the lock is raised are dropped silently; gauges bypass the gate
//! entirely so checkout/checkin never stall.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::Error;

pub mod registry;

const POOL_SIZE: usize = 0;
const IN_USE_CONNECTIONS: usize = 1;
const TOTAL_CHECKOUT_COUNT: usize = 2;
const TOTAL_CHECKOUT_TIME_US: usize = 3;
const TOTAL_USAGE_TIME_US: usize = 4;
const MAX_CHECKOUT_TIME_US: usize = 5;
const MAX_USAGE_TIME_US: usize = 6;
const RESET_LOCK: usize = 7;
const RESET_LOCK_QUEUE: usize = 8;
const SLOTS: usize = 9;

/// How long a reset sleeps between writer-queue probes.
const RESET_PROBE_INTERVAL: Duration = Duration::from_millis(5);

/// A pool's counters, at fixed slots.
#[derive(Debug)]
pub struct MetricsBlock {
    pool_idx: usize,
    slots: [AtomicU64; SLOTS],
}

impl MetricsBlock {
    pub(crate) fn new(pool_idx: usize, pool_size: usize) -> Self {
        let block = Self {
            pool_idx,
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        };
        block.slots[POOL_SIZE].store(pool_size as u64, Ordering::SeqCst);
        block
    }

    /// Which pool replica this block belongs to.
    pub fn pool_idx(&self) -> usize {
        self.pool_idx
    }

    pub(crate) fn incr_in_use(&self) {
        self.slots[IN_USE_CONNECTIONS].fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decr_in_use(&self) {
        self.slots[IN_USE_CONNECTIONS].fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn record_checkout(&self, elapsed_us: u64) {
        self.timing(|slots| {
            slots[TOTAL_CHECKOUT_COUNT].fetch_add(1, Ordering::SeqCst);
            slots[TOTAL_CHECKOUT_TIME_US].fetch_add(elapsed_us, Ordering::SeqCst);
            put_max(&slots[MAX_CHECKOUT_TIME_US], elapsed_us);
        });
    }

    pub(crate) fn record_usage(&self, elapsed_us: u64) {
        self.timing(|slots| {
            slots[TOTAL_USAGE_TIME_US].fetch_add(elapsed_us, Ordering::SeqCst);
            put_max(&slots[MAX_USAGE_TIME_US], elapsed_us);
        });
    }

    /// Run a timing-set update under the writer gate, dropping it silently
    /// when a reset holds the lock.
    fn timing(&self, update: impl FnOnce(&[AtomicU64; SLOTS])) {
        if self.slots[RESET_LOCK].load(Ordering::SeqCst) != 0 {
            return;
        }
        self.slots[RESET_LOCK_QUEUE].fetch_add(1, Ordering::SeqCst);
        update(&self.slots);
        self.slots[RESET_LOCK_QUEUE].fetch_sub(1, Ordering::SeqCst);
    }

    /// A consistent-enough snapshot of the block.
    ///
    /// Never blocks writers. Individual counters are each monotonic, but a
    /// reader racing writers may observe cross-counter tearing (a count
    /// without its paired time); averages are therefore approximate under
    /// load.
    pub fn status(&self) -> PoolStatus {
        let load = |slot: usize| self.slots[slot].load(Ordering::SeqCst);

        let pool_size = load(POOL_SIZE);
        let in_use = load(IN_USE_CONNECTIONS);

        PoolStatus {
            available: pool_size.saturating_sub(in_use),
            in_use,
            avg_checkout_us: rounded_avg(load(TOTAL_CHECKOUT_TIME_US), load(TOTAL_CHECKOUT_COUNT)),
            max_checkout_us: load(MAX_CHECKOUT_TIME_US),
            avg_usage_us: rounded_avg(load(TOTAL_USAGE_TIME_US), load(TOTAL_CHECKOUT_COUNT)),
            max_usage_us: load(MAX_USAGE_TIME_US),
        }
    }

    /// Zero the timing set once in-flight timing writers have drained.
    ///
    /// Probes the writer queue every ~5 ms until `deadline` elapses. On
    /// timeout the lock is released and the timing set is left as-is,
    /// possibly mutually inconsistent. Gauges are untouched either way.
    pub async fn reset(&self, deadline: Duration) -> Result<(), Error> {
        self.slots[RESET_LOCK].store(1, Ordering::SeqCst);
        let give_up = Instant::now() + deadline;

        while self.slots[RESET_LOCK_QUEUE].load(Ordering::SeqCst) > 0 {
            if Instant::now() >= give_up {
                self.slots[RESET_LOCK].store(0, Ordering::SeqCst);
                return Err(Error::ResetTimeout { waited: deadline });
            }
            tokio::time::sleep(RESET_PROBE_INTERVAL).await;
        }

        for slot in [
            TOTAL_CHECKOUT_COUNT,
            TOTAL_CHECKOUT_TIME_US,
            TOTAL_USAGE_TIME_US,
            MAX_CHECKOUT_TIME_US,
            MAX_USAGE_TIME_US,
        ] {
            self.slots[slot].store(0, Ordering::SeqCst);
        }

        self.slots[RESET_LOCK].store(0, Ordering::SeqCst);
        Ok(())
    }
}

/// Store `value` iff it exceeds the current slot value.
///
/// Load-then-store without compare-and-swap: a lower concurrent writer can
/// overwrite a higher one. Maxima are best-effort and only guaranteed to
/// be at least the average.
fn put_max(slot: &AtomicU64, value: u64) {
    if value > slot.load(Ordering::SeqCst) {
        slot.store(value, Ordering::SeqCst);
    }
}

fn rounded_avg(total: u64, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        (total + count / 2) / count
    }
}

/// Point-in-time pool health, as computed from a [`MetricsBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Workers not currently leased (`pool_size − in_use`).
    pub available: u64,
    /// Connections currently leased to callers.
    pub in_use: u64,
    /// Mean checkout wait, microseconds, rounded.
    pub avg_checkout_us: u64,
    /// Largest observed checkout wait, microseconds (best-effort).
    pub max_checkout_us: u64,
    /// Mean exchange duration, microseconds, rounded.
    pub avg_usage_us: u64,
    /// Largest observed exchange duration, microseconds (best-effort).
    pub max_usage_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[test]
    fn gauges_track_leases() {
        let block = MetricsBlock::new(0, 50);
        assert_eq!(block.status().available, 50);

        block.incr_in_use();
        block.incr_in_use();
        let status = block.status();
        assert_eq!(status.in_use, 2);
        assert_eq!(status.available, 48);

        block.decr_in_use();
        block.decr_in_use();
        assert_eq!(block.status().in_use, 0);
    }

    #[test]
    fn averages_round_to_nearest() {
        let block = MetricsBlock::new(0, 10);
        for i in 1..=10u64 {
            block.record_checkout(2 * i);
            block.record_usage(3 * i);
        }

        let status = block.status();
        assert_eq!(status.avg_checkout_us, 11);
        assert_eq!(status.max_checkout_us, 20);
        assert_eq!(status.avg_usage_us, 17); // 16.5 rounds up
        assert_eq!(status.max_usage_us, 30);
    }

    #[test]
    fn empty_block_reports_zero_averages() {
        let status = MetricsBlock::new(0, 1).status();
        assert_eq!(status.avg_checkout_us, 0);
        assert_eq!(status.max_checkout_us, 0);
        assert_eq!(status.avg_usage_us, 0);
        assert_eq!(status.max_usage_us, 0);
    }

    #[test]
    fn max_is_at_least_avg() {
        let block = MetricsBlock::new(0, 4);
        for us in [7, 3, 19, 4] {
            block.record_checkout(us);
        }
        let status = block.status();
        assert!(status.max_checkout_us >= status.avg_checkout_us);
    }

    #[tokio::test]
    async fn reset_zeroes_the_timing_set_and_keeps_gauges() {
        let block = MetricsBlock::new(0, 50);
        block.incr_in_use();
        block.record_checkout(5);
        block.record_usage(15);

        block.reset(Duration::from_secs(1)).await.unwrap();

        let status = block.status();
        assert_eq!(status.avg_checkout_us, 0);
        assert_eq!(status.max_checkout_us, 0);
        assert_eq!(status.avg_usage_us, 0);
        assert_eq!(status.max_usage_us, 0);
        assert_eq!(status.in_use, 1);
        assert_eq!(status.available, 49);
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let block = MetricsBlock::new(0, 1);
        block.record_checkout(9);

        block.reset(Duration::from_secs(1)).await.unwrap();
        block.reset(Duration::from_secs(1)).await.unwrap();

        assert_eq!(block.status().avg_checkout_us, 0);
        assert_eq!(block.status().max_checkout_us, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_times_out_while_a_writer_is_parked() {
        let block = MetricsBlock::new(0, 1);

        // Park a writer in the gate.
        block.slots[RESET_LOCK_QUEUE].fetch_add(1, Ordering::SeqCst);
        let error = block.reset(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(error, Error::ResetTimeout { .. }));

        // Lock must be released so traffic resumes after the failed reset.
        assert_eq!(block.slots[RESET_LOCK].load(Ordering::SeqCst), 0);

        block.slots[RESET_LOCK_QUEUE].fetch_sub(1, Ordering::SeqCst);
        block.reset(Duration::from_millis(20)).await.unwrap();
    }

    #[test]
    fn timing_writes_drop_while_locked() {
        let block = MetricsBlock::new(0, 1);
        block.slots[RESET_LOCK].store(1, Ordering::SeqCst);
        block.record_checkout(100);
        block.slots[RESET_LOCK].store(0, Ordering::SeqCst);

        assert_eq!(block.status().avg_checkout_us, 0);

        block.record_checkout(100);
        assert_eq!(block.status().avg_checkout_us, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reset_under_concurrent_writers() {
        let block = Arc::new(MetricsBlock::new(0, 8));

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let block = block.clone();
                tokio::task::spawn_blocking(move || {
                    for i in 0..10_000u64 {
                        block.record_checkout(i % 32);
                        block.record_usage(i % 64);
                    }
                })
            })
            .collect();

        // Interleave resets with the writers; each one either times out or
        // leaves the timing set zeroed at the instant it returns.
        for _ in 0..10 {
            let _ = block.reset(Duration::from_millis(50)).await;
        }

        for writer in writers {
            writer.await.unwrap();
        }

        block.reset(Duration::from_secs(1)).await.unwrap();
        let status = block.status();
        assert_eq!(status.avg_checkout_us, 0);
        assert_eq!(status.avg_usage_us, 0);
        assert_eq!(status.max_checkout_us, 0);
        assert_eq!(status.max_usage_us, 0);
    }
}
