//! Background pruning of the message history down to a fixed row cap.

use crate::error::Result;
use crate::store::TicketStore;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Remove the oldest history rows until at most `cap` remain. Returns how many rows
/// were deleted.
pub async fn sweep_once(store: &dyn TicketStore, cap: u64) -> Result<u64> {
    let removed = store.purge_oldest_messages(cap).await?;
    if removed > 0 {
        tracing::info!(removed, cap, "history pruned");
    } else {
        tracing::debug!(cap, "history within retention cap");
    }
    Ok(removed)
}

/// Sweep immediately, then every `interval` until `shutdown` fires. A zero interval
/// sweeps once and returns.
pub async fn run_sweeper(
    store: Arc<dyn TicketStore>,
    cap: u64,
    interval: Duration,
    shutdown: CancellationToken,
) {
    if interval.is_zero() {
        if let Err(error) = sweep_once(store.as_ref(), cap).await {
            tracing::warn!(%error, "retention sweep failed");
        }
        return;
    }

    // First tick completes immediately, which gives the startup sweep.
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(error) = sweep_once(store.as_ref(), cap).await {
                    tracing::warn!(%error, "retention sweep failed");
                }
            }
        }
    }
    tracing::debug!("retention sweeper stopped");
}
