//! The pool manager façade.
//!
//! Every registry read and write goes through [`PoolManager`]. The registry
//! lock is never held across an await on a collaborator: ledger writes and all
//! provisioner calls happen outside it, and only the recorded result is written
//! back under the lock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::ledger::{CostLedger, Money};
use crate::provisioner::SandboxHandle;
use crate::state::{DemoSession, Registry, SessionStatus, WarmSandbox};

/// Returned by a successful [`PoolManager::apply_usage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReceipt {
    pub session_id: Uuid,
    pub usage_remaining: u32,
    pub time_remaining: Duration,
}

/// Point-in-time view of pool supply and demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub available: bool,
    pub warm_count: usize,
    pub active_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostStatus {
    pub daily_cap: Money,
    pub remaining: Money,
    pub exhausted: bool,
    /// Whether the last replenishment tick skipped provisioning for budget reasons.
    pub throttled: bool,
    pub provisioning_in_flight: usize,
}

/// What the reaper should destroy this tick.
#[derive(Debug, Default)]
pub struct ReapBatch {
    /// Sessions moved to expired during this collection.
    pub expired: usize,
    pub handles: Vec<SandboxHandle>,
}

pub struct PoolManager {
    config: PoolConfig,
    ledger: Arc<dyn CostLedger>,
    registry: Mutex<Registry>,
    reaper_wake: Notify,
    throttled: AtomicBool,
    in_flight: AtomicUsize,
}

impl PoolManager {
    pub fn new(config: PoolConfig, ledger: Arc<dyn CostLedger>) -> Self {
        Self {
            config,
            ledger,
            registry: Mutex::new(Registry::new(Instant::now())),
            reaper_wake: Notify::new(),
            throttled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn CostLedger> {
        &self.ledger
    }

    /// Hands a warm sandbox to `requester_id` as a new active session.
    ///
    /// Never provisions on demand: an empty pool is reported as
    /// [`PoolError::PoolEmpty`] and the caller decides how to degrade.
    pub async fn claim(&self, requester_id: &str) -> Result<DemoSession, PoolError> {
        let now = Instant::now();
        let mut registry = self.registry.lock().await;
        let slot = registry.take_healthy(now).ok_or(PoolError::PoolEmpty)?;
        let session = DemoSession::new(
            requester_id,
            slot.handle,
            now,
            self.config.max_session_duration,
            self.config.max_usage_per_session,
        );
        registry.insert_session(session.clone());
        let warm_left = registry.warm_count();
        drop(registry);

        info!(
            session_id = %session.id,
            sandbox_id = %session.sandbox.id,
            requester = requester_id,
            warm_left,
            "sandbox claimed"
        );
        Ok(session)
    }

    /// Charges one unit of usage against a session.
    pub async fn apply_usage(
        &self,
        session_id: Uuid,
        cost_estimate: Money,
    ) -> Result<UsageReceipt, PoolError> {
        self.reserve_usage(session_id).await?;

        if self.ledger.is_exhausted() {
            self.cancel_reservation(session_id).await;
            return Err(PoolError::BudgetExhausted);
        }
        if let Err(e) = self.ledger.record_spend(cost_estimate).await {
            warn!(session_id = %session_id, error = %e, "failed to record usage spend");
            self.cancel_reservation(session_id).await;
            return Err(e.into());
        }

        let now = Instant::now();
        let mut registry = self.registry.lock().await;
        let session = registry
            .session_mut(&session_id)
            .ok_or(PoolError::SessionExpired(session_id))?;
        session.pending_usage = session.pending_usage.saturating_sub(1);
        // The session may have ended while the spend was being recorded.
        if session.status.is_terminal() || session.is_past_deadline(now) {
            if session.finish(SessionStatus::Expired) {
                self.reaper_wake.notify_one();
            }
            debug!(session_id = %session_id, "usage dropped, session ended mid-charge");
            return Err(PoolError::SessionExpired(session_id));
        }
        session.usage_count += 1;

        let receipt = UsageReceipt {
            session_id,
            usage_remaining: session.usage_remaining(),
            time_remaining: session.time_remaining(now),
        };
        debug!(
            session_id = %session_id,
            usage = session.usage_count,
            cost = %cost_estimate,
            "usage applied"
        );
        Ok(receipt)
    }

    /// Validates the session and reserves one usage slot for it.
    async fn reserve_usage(&self, session_id: Uuid) -> Result<(), PoolError> {
        let now = Instant::now();
        let mut registry = self.registry.lock().await;
        let session = registry
            .session_mut(&session_id)
            .ok_or(PoolError::SessionNotFound(session_id))?;

        if session.status.is_terminal() {
            return Err(PoolError::SessionExpired(session_id));
        }
        if session.is_past_deadline(now) {
            session.finish(SessionStatus::Expired);
            drop(registry);
            info!(session_id = %session_id, "session expired on use");
            self.reaper_wake.notify_one();
            return Err(PoolError::SessionExpired(session_id));
        }
        if session.usage_count + session.pending_usage >= session.usage_cap {
            return Err(PoolError::UsageExceeded {
                session_id,
                cap: session.usage_cap,
            });
        }
        session.pending_usage += 1;
        Ok(())
    }

    async fn cancel_reservation(&self, session_id: Uuid) {
        let mut registry = self.registry.lock().await;
        if let Some(session) = registry.session_mut(&session_id) {
            session.pending_usage = session.pending_usage.saturating_sub(1);
        }
    }

    /// Ends a session early. Idempotent: unknown or already-terminal sessions
    /// are a no-op. The sandbox is queued for the reaper to destroy.
    pub async fn release(&self, session_id: Uuid) -> Result<(), PoolError> {
        let mut registry = self.registry.lock().await;
        let released = match registry.session_mut(&session_id) {
            Some(session) => session.finish(SessionStatus::Released),
            None => false,
        };
        if !released {
            debug!(session_id = %session_id, "release ignored, session not active");
            return Ok(());
        }
        if let Some(session) = registry.remove_session(&session_id) {
            info!(
                session_id = %session_id,
                sandbox_id = %session.sandbox.id,
                usage = session.usage_count,
                "session released"
            );
            registry.retire(session.sandbox);
        }
        drop(registry);
        self.reaper_wake.notify_one();
        Ok(())
    }

    pub async fn availability(&self) -> PoolStatus {
        let now = Instant::now();
        let mut registry = self.registry.lock().await;
        if registry.expire_overdue(now) > 0 {
            self.reaper_wake.notify_one();
        }
        let warm_count = registry.warm_count();
        let active_count = registry.active_count();
        let starved = registry
            .empty_for(now)
            .is_some_and(|empty| empty > self.config.empty_grace_period);
        drop(registry);

        PoolStatus {
            available: !starved && !self.ledger.is_exhausted(),
            warm_count,
            active_count,
        }
    }

    pub fn cost_status(&self) -> CostStatus {
        CostStatus {
            daily_cap: self.config.daily_cost_cap,
            remaining: self.ledger.remaining_budget(),
            exhausted: self.ledger.is_exhausted(),
            throttled: self.throttled.load(Ordering::Relaxed),
            provisioning_in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of a session still held in the registry.
    pub async fn session(&self, session_id: Uuid) -> Option<DemoSession> {
        self.registry.lock().await.session(&session_id).cloned()
    }

    pub async fn warm_count(&self) -> usize {
        self.registry.lock().await.warm_count()
    }

    pub async fn warm_ids(&self) -> Vec<String> {
        self.registry.lock().await.warm_ids()
    }

    pub(crate) async fn insert_warm(&self, handle: SandboxHandle) {
        let mut registry = self.registry.lock().await;
        registry.insert_warm(WarmSandbox::new(handle, Instant::now()));
    }

    pub(crate) async fn take_idle(&self, limit: usize) -> Vec<SandboxHandle> {
        let now = Instant::now();
        self.registry
            .lock()
            .await
            .take_idle(now, self.config.idle_age_threshold, limit)
    }

    /// Applies probe results; returns the unhealthy slots removed from the pool.
    pub(crate) async fn record_health(&self, results: Vec<(String, bool)>) -> Vec<SandboxHandle> {
        let now = Instant::now();
        let mut registry = self.registry.lock().await;
        results
            .into_iter()
            .filter_map(|(id, healthy)| registry.record_health(&id, healthy, now))
            .collect()
    }

    /// Expires overdue sessions and collects every sandbox awaiting destruction.
    pub(crate) async fn collect_for_reaping(&self) -> ReapBatch {
        let now = Instant::now();
        let mut registry = self.registry.lock().await;
        let expired = registry.expire_overdue(now);
        let mut handles = registry.remove_terminal();
        handles.extend(registry.drain_retired());
        ReapBatch { expired, handles }
    }

    /// Queues sandboxes whose destruction failed for another attempt.
    pub(crate) async fn retire(&self, handles: Vec<SandboxHandle>) {
        if handles.is_empty() {
            return;
        }
        let mut registry = self.registry.lock().await;
        for handle in handles {
            registry.retire(handle);
        }
    }

    /// Removes every sandbox from the pool, for shutdown.
    pub async fn drain_all(&self) -> Vec<SandboxHandle> {
        self.registry.lock().await.drain_all(Instant::now())
    }

    pub(crate) fn reaper_wake(&self) -> &Notify {
        &self.reaper_wake
    }

    pub(crate) fn set_throttled(&self, throttled: bool) {
        self.throttled.store(throttled, Ordering::Relaxed);
    }

    pub(crate) fn set_in_flight(&self, in_flight: usize) {
        self.in_flight.store(in_flight, Ordering::Relaxed);
    }
}
