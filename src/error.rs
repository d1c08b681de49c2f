//! Error types for the pool, its collaborators and configuration.

use thiserror::Error;
use uuid::Uuid;

/// Errors returned to foreground callers of the pool manager.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool empty: no warm sandboxes available")]
    PoolEmpty,

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("session expired: {0}")]
    SessionExpired(Uuid),

    #[error("usage exceeded: session {session_id} reached its cap of {cap}")]
    UsageExceeded { session_id: Uuid, cap: u32 },

    #[error("budget exhausted for the current period")]
    BudgetExhausted,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl PoolError {
    /// Stable machine-readable kind, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::PoolEmpty => "pool_empty",
            PoolError::SessionNotFound(_) => "session_not_found",
            PoolError::SessionExpired(_) => "session_expired",
            PoolError::UsageExceeded { .. } => "usage_exceeded",
            PoolError::BudgetExhausted => "budget_exhausted",
            PoolError::Ledger(_) => "ledger_error",
        }
    }
}

/// Errors raised by a [`Provisioner`](crate::provisioner::Provisioner).
///
/// These never reach a foreground caller; the background loops log them and
/// fold them into their retry state.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("sandbox creation failed: {0}")]
    CreateFailed(String),

    #[error("sandbox {id} destroy failed: {reason}")]
    DestroyFailed { id: String, reason: String },

    #[error("provisioner request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provisioner task failed: {0}")]
    Task(String),
}

/// Errors raised by a [`CostLedger`](crate::ledger::CostLedger).
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Rejected [`PoolConfig`](crate::config::PoolConfig) values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("budget alert threshold must be within 1..=100, got {0}")]
    AlertThreshold(u8),

    #[error("flavor must not be empty")]
    EmptyFlavor,
}
