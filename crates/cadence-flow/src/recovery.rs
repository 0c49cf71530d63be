//! Stale-lease recovery.
//!
//! A worker that crashes or hangs mid-delivery leaves its claimed rows
//! `PROCESSING` with a lease that eventually expires. This loop returns
//! those rows to `PENDING` so a surviving worker can re-claim them. It is
//! idempotent and self-coordinating through the store: every instance
//! runs it, and concurrent runs release disjoint rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::metrics::names as metric_names;
use crate::store::EventStore;

/// Default interval between recovery passes.
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic expired-lease release loop.
pub struct RecoveryLoop {
    store: Arc<dyn EventStore>,
    interval: Duration,
}

impl RecoveryLoop {
    /// Creates a recovery loop with the given pass interval.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Runs until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("recovery loop shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "lease recovery pass failed");
                    }
                }
            }
        }
    }

    /// One recovery pass; returns the number of leases released.
    ///
    /// # Errors
    ///
    /// Returns an error if the bulk release fails.
    pub async fn run_once(&self) -> Result<u64> {
        let released = self.store.release_expired(Utc::now()).await?;
        if released > 0 {
            counter!(metric_names::LEASES_RELEASED_TOTAL).increment(released);
            info!(released, "released expired leases");
        }
        Ok(released)
    }
}
