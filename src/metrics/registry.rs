//! Process-wide directory of metrics blocks.
//!
//! Blocks are keyed by `(name, origin)`, where `name` tags the client
//! instance the pool belongs to. One origin may be backed by several pool
//! replicas; each registers its own block under its `pool_idx`, and status
//! reads return one entry per replica without merging.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use super::{MetricsBlock, PoolStatus};
use crate::error::Error;
use crate::origin::Origin;

static DIRECTORY: Lazy<DashMap<(String, Origin), Vec<Arc<MetricsBlock>>>> =
    Lazy::new(DashMap::new);

/// Register (or fetch) the block for one pool replica.
///
/// Idempotent per `(name, origin, pool_idx)`: re-initializing an already
/// registered replica returns the existing block untouched.
pub(crate) fn init(name: &str, origin: &Origin, pool_idx: usize, pool_size: usize) -> Arc<MetricsBlock> {
    let mut entry = DIRECTORY
        .entry((name.to_owned(), origin.clone()))
        .or_default();

    if let Some(existing) = entry.iter().find(|block| block.pool_idx() == pool_idx) {
        return existing.clone();
    }

    let block = Arc::new(MetricsBlock::new(pool_idx, pool_size));
    entry.push(block.clone());
    block
}

fn refs(name: &str, origin: &Origin) -> Option<Vec<Arc<MetricsBlock>>> {
    DIRECTORY
        .get(&(name.to_owned(), origin.clone()))
        .map(|entry| entry.clone())
}

/// Read the status of every pool replica serving `origin` under `name`.
///
/// Returns [`Error::MetricsNotFound`] when no metrics are registered,
/// which is also the answer for pools started with metrics disabled.
pub fn pool_status(name: &str, origin: &Origin) -> Result<Vec<PoolStatus>, Error> {
    let blocks = refs(name, origin).ok_or_else(|| Error::MetricsNotFound {
        name: name.to_owned(),
        origin: origin.clone(),
    })?;

    Ok(blocks.iter().map(|block| block.status()).collect())
}

/// Reset the timing counters of every pool replica serving `origin`.
///
/// `deadline` bounds each replica's writer-drain wait; see
/// [`MetricsBlock::reset`].
pub async fn reset_metrics(name: &str, origin: &Origin, deadline: Duration) -> Result<(), Error> {
    let blocks = refs(name, origin).ok_or_else(|| Error::MetricsNotFound {
        name: name.to_owned(),
        origin: origin.clone(),
    })?;

    for block in blocks {
        block.reset(deadline).await?;
    }
    Ok(())
}
