//! Spend tracking against a rolling budget window.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::LedgerError;

/// Length of one budget period for [`DailyLedger`].
pub const DAILY_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// An amount of money in US cents.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: u64) -> Self {
        Money(cents)
    }

    pub const fn cents(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Records spend against a budget.
///
/// `remaining_budget` and `is_exhausted` are expected to be cheap reads; only
/// `record_spend` may do I/O.
#[async_trait]
pub trait CostLedger: Send + Sync {
    fn remaining_budget(&self) -> Money;

    async fn record_spend(&self, amount: Money) -> Result<(), LedgerError>;

    fn is_exhausted(&self) -> bool;
}

/// Spend accumulated in the current budget period.
#[derive(Debug)]
struct CostWindow {
    started_at: Instant,
    spent: Money,
    alerted: bool,
}

/// In-memory ledger whose window resets every `period`.
///
/// Spend is allowed to overshoot the cap; the pool checks exhaustion before
/// committing to new work, so overshoot is bounded by one operation.
#[derive(Debug)]
pub struct DailyLedger {
    cap: Money,
    period: Duration,
    alert_threshold: u8,
    window: Mutex<CostWindow>,
}

impl DailyLedger {
    pub fn new(cap: Money, alert_threshold: u8) -> Self {
        Self::with_period(cap, alert_threshold, DAILY_PERIOD)
    }

    pub fn with_period(cap: Money, alert_threshold: u8, period: Duration) -> Self {
        Self {
            cap,
            period,
            alert_threshold,
            window: Mutex::new(CostWindow {
                started_at: Instant::now(),
                spent: Money::ZERO,
                alerted: false,
            }),
        }
    }

    pub fn cap(&self) -> Money {
        self.cap
    }

    /// Spend recorded in the current period.
    pub fn spent(&self) -> Money {
        self.current_window().spent
    }

    /// Locks the window, starting a fresh period if the current one elapsed.
    fn current_window(&self) -> MutexGuard<'_, CostWindow> {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = window.started_at.elapsed();
        if elapsed >= self.period {
            let periods = (elapsed.as_secs_f64() / self.period.as_secs_f64()).floor();
            window.started_at += self.period.mul_f64(periods);
            if !window.spent.is_zero() {
                info!(spent = %window.spent, cap = %self.cap, "budget period rolled over");
            }
            window.spent = Money::ZERO;
            window.alerted = false;
        }
        window
    }
}

#[async_trait]
impl CostLedger for DailyLedger {
    fn remaining_budget(&self) -> Money {
        self.cap.saturating_sub(self.current_window().spent)
    }

    async fn record_spend(&self, amount: Money) -> Result<(), LedgerError> {
        let mut window = self.current_window();
        window.spent = window.spent.saturating_add(amount);

        let threshold = self.cap.cents().saturating_mul(u64::from(self.alert_threshold)) / 100;
        if !window.alerted && window.spent.cents() >= threshold {
            window.alerted = true;
            warn!(
                spent = %window.spent,
                cap = %self.cap,
                threshold_percent = self.alert_threshold,
                "budget alert threshold crossed"
            );
        }
        if window.spent >= self.cap {
            warn!(spent = %window.spent, cap = %self.cap, "budget exhausted");
        }
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.current_window().spent >= self.cap
    }
}
