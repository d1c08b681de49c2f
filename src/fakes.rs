//! In-memory collaborators for local development and tests.
//!
//! `MockProvisioner` hands out fake sandboxes without touching the host, counts
//! every call, and lets callers inject failures and unhealthy slots.
//! `MockLedger` is a cost ledger with injectable latency and write failures.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::{LedgerError, ProvisionError};
use crate::ledger::{CostLedger, Money};
use crate::provisioner::{Provisioner, SandboxHandle};

#[derive(Debug, Default)]
struct MockState {
    live: HashSet<String>,
    unhealthy: HashSet<String>,
    destroy_calls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MockProvisioner {
    latency: Duration,
    create_calls: AtomicUsize,
    failing: AtomicBool,
    failing_destroys: AtomicBool,
    state: Mutex<MockState>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `create` sleeps for `latency` before returning.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Makes subsequent `create` calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes subsequent `destroy` calls fail (or succeed again).
    pub fn set_failing_destroys(&self, failing: bool) {
        self.failing_destroys.store(failing, Ordering::SeqCst);
    }

    /// Makes `health_check` report `sandbox_id` as unhealthy.
    pub fn mark_unhealthy(&self, sandbox_id: &str) {
        self.state().unhealthy.insert(sandbox_id.to_string());
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Total `destroy` calls, including repeats for the same id.
    pub fn destroy_calls(&self) -> usize {
        self.state().destroy_calls.len()
    }

    pub fn destroy_calls_for(&self, sandbox_id: &str) -> usize {
        self.state()
            .destroy_calls
            .iter()
            .filter(|id| id.as_str() == sandbox_id)
            .count()
    }

    /// Sandboxes created and not yet destroyed.
    pub fn live_count(&self) -> usize {
        self.state().live.len()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn create(&self, flavor: &str) -> Result<SandboxHandle, ProvisionError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProvisionError::CreateFailed("mock provisioner failure".into()));
        }

        let id = format!("mock-{}", Uuid::new_v4().simple());
        self.state().live.insert(id.clone());
        debug!(sandbox_id = %id, flavor, "mock sandbox created");
        Ok(SandboxHandle {
            endpoint: format!("mock://{id}"),
            id,
            flavor: flavor.to_string(),
        })
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), ProvisionError> {
        let mut state = self.state();
        state.destroy_calls.push(sandbox_id.to_string());
        if self.failing_destroys.load(Ordering::SeqCst) {
            return Err(ProvisionError::DestroyFailed {
                id: sandbox_id.to_string(),
                reason: "mock provisioner failure".into(),
            });
        }
        state.live.remove(sandbox_id);
        Ok(())
    }

    async fn health_check(&self, sandbox_id: &str) -> bool {
        let state = self.state();
        state.live.contains(sandbox_id) && !state.unhealthy.contains(sandbox_id)
    }
}

/// Ledger with a fixed cap and no budget period.
#[derive(Debug)]
pub struct MockLedger {
    cap: Money,
    latency: Duration,
    failing: AtomicBool,
    spent: Mutex<Money>,
}

impl MockLedger {
    pub fn new(cap: Money) -> Self {
        Self::with_latency(cap, Duration::ZERO)
    }

    /// Every `record_spend` sleeps for `latency` before it is applied.
    pub fn with_latency(cap: Money, latency: Duration) -> Self {
        Self {
            cap,
            latency,
            failing: AtomicBool::new(false),
            spent: Mutex::new(Money::ZERO),
        }
    }

    /// Makes subsequent `record_spend` calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn spent(&self) -> Money {
        *self.spent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CostLedger for MockLedger {
    fn remaining_budget(&self) -> Money {
        self.cap.saturating_sub(self.spent())
    }

    async fn record_spend(&self, amount: Money) -> Result<(), LedgerError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("mock ledger failure".into()));
        }
        let mut spent = self.spent.lock().unwrap_or_else(PoisonError::into_inner);
        *spent = spent.saturating_add(amount);
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.spent() >= self.cap
    }
}
