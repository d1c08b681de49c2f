//! Replenishment loop: keeps the warm registry at its target size.
//!
//! One `Replenisher` drives every provisioning decision, so reading the budget
//! and acting on it never races another replenisher.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::ledger::CostLedger;
use crate::pool::PoolManager;
use crate::provisioner::{Provisioner, SandboxHandle};

/// Upper bound on ticks skipped after repeated provisioning failures.
const MAX_BACKOFF_TICKS: u32 = 32;

/// What a single tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Provisioning calls started this tick.
    pub requested: usize,
    /// Idle slots destroyed.
    pub retired: usize,
    /// Unhealthy slots evicted.
    pub evicted: usize,
    /// Provisioning was skipped because the budget is exhausted.
    pub throttled: bool,
    /// Provisioning was skipped because of earlier failures.
    pub backing_off: bool,
}

pub struct Replenisher {
    pool: Arc<PoolManager>,
    provisioner: Arc<dyn Provisioner>,
    in_flight: JoinSet<Result<(), ProvisionError>>,
    consecutive_failures: u32,
    skip_ticks: u32,
}

impl Replenisher {
    pub fn new(pool: Arc<PoolManager>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            pool,
            provisioner,
            in_flight: JoinSet::new(),
            consecutive_failures: 0,
            skip_ticks: 0,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Runs ticks every `replenish_interval` until `shutdown` flips to true,
    /// then waits for provisioning calls still in flight.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.pool.config().replenish_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            target_warm = self.pool.config().target_warm_count,
            "replenishment loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    debug!(?report, "replenish tick");
                }
                _ = shutdown.changed() => break,
            }
        }

        self.settle().await;
        info!("replenishment loop stopped");
    }

    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        self.collect_finished();

        report.evicted = self.probe_health().await;

        let pool = self.pool.clone();
        let config = pool.config();
        let warm = pool.warm_count().await;
        let in_flight = self.in_flight.len();
        let deficit = config.target_warm_count as isize - warm as isize - in_flight as isize;

        if deficit <= 0 {
            let idle = self.pool.take_idle(config.retire_batch_size).await;
            if !idle.is_empty() {
                info!(count = idle.len(), "retiring idle warm sandboxes");
            }
            report.retired = self.destroy_all(idle).await;
            self.pool.set_throttled(false);
            self.publish_in_flight();
            return report;
        }

        if self.skip_ticks > 0 {
            self.skip_ticks -= 1;
            report.backing_off = true;
            debug!(
                skip_ticks = self.skip_ticks,
                failures = self.consecutive_failures,
                "provisioning backing off"
            );
            self.publish_in_flight();
            return report;
        }

        let ledger = self.pool.ledger().clone();
        if ledger.is_exhausted() {
            self.throttle(deficit, &mut report);
            return report;
        }

        let slots = config.max_concurrent_provisioning.saturating_sub(in_flight);
        let affordable = if config.provision_cost.is_zero() {
            usize::MAX
        } else {
            let remaining = ledger.remaining_budget().cents() / config.provision_cost.cents();
            usize::try_from(remaining)
                .unwrap_or(usize::MAX)
                .saturating_sub(in_flight)
        };
        if affordable == 0 {
            self.throttle(deficit, &mut report);
            return report;
        }
        self.pool.set_throttled(false);

        let count = (deficit as usize).min(slots).min(affordable);
        if count > 0 {
            info!(deficit, warm, in_flight, count, "provisioning warm sandboxes");
        }
        for _ in 0..count {
            self.spawn_create(ledger.clone());
        }
        report.requested = count;
        self.publish_in_flight();
        report
    }

    /// Waits for every provisioning call in flight and records the outcomes.
    pub async fn settle(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            self.record_outcome(joined);
        }
        self.publish_in_flight();
    }

    fn throttle(&self, deficit: isize, report: &mut TickReport) {
        warn!(deficit, "budget exhausted, skipping provisioning this tick");
        self.pool.set_throttled(true);
        report.throttled = true;
        self.publish_in_flight();
    }

    fn spawn_create(&mut self, ledger: Arc<dyn CostLedger>) {
        let pool = self.pool.clone();
        let provisioner = self.provisioner.clone();
        self.in_flight.spawn(async move {
            let config = pool.config();
            let handle = provisioner.create(&config.flavor).await?;
            info!(sandbox_id = %handle.id, flavor = %handle.flavor, "warm sandbox ready");
            pool.insert_warm(handle).await;
            if let Err(e) = ledger.record_spend(config.provision_cost).await {
                warn!(error = %e, "failed to record provisioning spend");
            }
            Ok(())
        });
    }

    fn collect_finished(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            self.record_outcome(joined);
        }
    }

    fn record_outcome(&mut self, joined: Result<Result<(), ProvisionError>, tokio::task::JoinError>) {
        let outcome = joined
            .map_err(|e| ProvisionError::Task(e.to_string()))
            .and_then(|result| result);
        match outcome {
            Ok(()) => {
                self.consecutive_failures = 0;
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.skip_ticks = backoff_ticks(self.consecutive_failures);
                warn!(
                    error = %e,
                    failures = self.consecutive_failures,
                    skip_ticks = self.skip_ticks,
                    "sandbox provisioning failed"
                );
            }
        }
    }

    /// Probes every warm slot and destroys the ones that fail.
    async fn probe_health(&self) -> usize {
        let ids = self.pool.warm_ids().await;
        if ids.is_empty() {
            return 0;
        }
        let probes = ids.into_iter().map(|id| {
            let provisioner = self.provisioner.clone();
            async move {
                let healthy = provisioner.health_check(&id).await;
                (id, healthy)
            }
        });
        let results = join_all(probes).await;
        let unhealthy = self.pool.record_health(results).await;
        for handle in &unhealthy {
            warn!(sandbox_id = %handle.id, "evicting unhealthy warm sandbox");
        }
        self.destroy_all(unhealthy).await
    }

    /// Destroys `handles`, queueing failures for the reaper. Returns how many succeeded.
    async fn destroy_all(&self, handles: Vec<SandboxHandle>) -> usize {
        if handles.is_empty() {
            return 0;
        }
        let results = join_all(handles.iter().map(|h| self.provisioner.destroy(&h.id))).await;
        let mut failed = Vec::new();
        let mut destroyed = 0;
        for (handle, result) in handles.into_iter().zip(results) {
            match result {
                Ok(()) => destroyed += 1,
                Err(e) => {
                    warn!(sandbox_id = %handle.id, error = %e, "destroy failed, handing to reaper");
                    failed.push(handle);
                }
            }
        }
        self.pool.retire(failed).await;
        destroyed
    }

    fn publish_in_flight(&self) {
        self.pool.set_in_flight(self.in_flight.len());
    }
}

/// Ticks to skip after `failures` consecutive provisioning failures.
fn backoff_ticks(failures: u32) -> u32 {
    if failures == 0 {
        return 0;
    }
    let exp = (failures - 1).min(6);
    ((1u32 << exp) - 1).min(MAX_BACKOFF_TICKS)
}
