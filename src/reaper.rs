//! Reaper loop: expires overdue sessions and destroys retired sandboxes.
//!
//! This is the backstop for sessions nobody releases. It also owns retries for
//! every destroy that failed elsewhere.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::pool::PoolManager;
use crate::provisioner::Provisioner;

/// Destroy attempts per sandbox before it is abandoned.
pub const MAX_DESTROY_ATTEMPTS: u32 = 5;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: usize,
    pub destroyed: usize,
    /// Destroys that failed and were queued for another attempt.
    pub retrying: usize,
    /// Destroys that failed for the last time.
    pub abandoned: usize,
}

pub struct Reaper {
    pool: Arc<PoolManager>,
    provisioner: Arc<dyn Provisioner>,
    attempts: HashMap<String, u32>,
}

impl Reaper {
    pub fn new(pool: Arc<PoolManager>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            pool,
            provisioner,
            attempts: HashMap::new(),
        }
    }

    /// Reaps every `reaper_interval`, and early whenever a session is released
    /// or lazily expired, until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let pool = self.pool.clone();
        let mut ticker = interval(pool.config().reaper_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("reaper loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = pool.reaper_wake().notified() => {}
                _ = shutdown.changed() => break,
            }
            let report = self.tick().await;
            if report != ReapReport::default() {
                debug!(?report, "reaper tick");
            }
        }
        info!("reaper loop stopped");
    }

    pub async fn tick(&mut self) -> ReapReport {
        let batch = self.pool.collect_for_reaping().await;
        let mut report = ReapReport {
            expired: batch.expired,
            ..ReapReport::default()
        };
        if batch.expired > 0 {
            info!(count = batch.expired, "expired abandoned sessions");
        }
        if batch.handles.is_empty() {
            return report;
        }

        let results = join_all(
            batch
                .handles
                .iter()
                .map(|handle| self.provisioner.destroy(&handle.id)),
        )
        .await;

        let mut retry = Vec::new();
        for (handle, result) in batch.handles.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    self.attempts.remove(&handle.id);
                    report.destroyed += 1;
                    debug!(sandbox_id = %handle.id, "sandbox destroyed");
                }
                Err(e) => {
                    let attempts = self.attempts.entry(handle.id.clone()).or_insert(0);
                    *attempts += 1;
                    if *attempts >= MAX_DESTROY_ATTEMPTS {
                        error!(
                            sandbox_id = %handle.id,
                            attempts = *attempts,
                            error = %e,
                            "giving up on sandbox destroy"
                        );
                        self.attempts.remove(&handle.id);
                        report.abandoned += 1;
                    } else {
                        warn!(
                            sandbox_id = %handle.id,
                            attempts = *attempts,
                            error = %e,
                            "sandbox destroy failed, will retry"
                        );
                        retry.push(handle);
                        report.retrying += 1;
                    }
                }
            }
        }
        self.pool.retire(retry).await;
        report
    }
}
