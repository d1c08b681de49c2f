//! Pool configuration.

use std::time::Duration;

use crate::error::ConfigError;
use crate::ledger::Money;

/// Immutable settings shared by the façade and both background loops.
///
/// There is no `Default`; the binary maps its CLI flags into
/// this struct and tests spell every field out.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of unclaimed sandboxes the replenisher tries to keep warm.
    pub target_warm_count: usize,
    /// Upper bound on provisioning calls in flight at once.
    pub max_concurrent_provisioning: usize,
    /// Warm slots older than this are retired when the pool is not in deficit.
    pub idle_age_threshold: Duration,
    pub max_session_duration: Duration,
    pub max_usage_per_session: u32,
    pub replenish_interval: Duration,
    pub reaper_interval: Duration,
    pub daily_cost_cap: Money,
    /// Template identifier handed to the provisioner.
    pub flavor: String,
    /// Spend recorded for every successfully provisioned sandbox.
    pub provision_cost: Money,
    /// How long the warm registry may stay empty before claims are advertised
    /// as unavailable.
    pub empty_grace_period: Duration,
    /// Max idle slots retired per replenishment tick.
    pub retire_batch_size: usize,
    /// Percentage of the daily cap at which the ledger warns once.
    pub budget_alert_threshold: u8,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_warm_count == 0 {
            return Err(ConfigError::Zero("target_warm_count"));
        }
        if self.max_concurrent_provisioning == 0 {
            return Err(ConfigError::Zero("max_concurrent_provisioning"));
        }
        if self.max_session_duration.is_zero() {
            return Err(ConfigError::Zero("max_session_duration"));
        }
        if self.max_usage_per_session == 0 {
            return Err(ConfigError::Zero("max_usage_per_session"));
        }
        if self.replenish_interval.is_zero() {
            return Err(ConfigError::Zero("replenish_interval"));
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::Zero("reaper_interval"));
        }
        if self.retire_batch_size == 0 {
            return Err(ConfigError::Zero("retire_batch_size"));
        }
        if !(1..=100).contains(&self.budget_alert_threshold) {
            return Err(ConfigError::AlertThreshold(self.budget_alert_threshold));
        }
        if self.flavor.trim().is_empty() {
            return Err(ConfigError::EmptyFlavor);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> PoolConfig {
    PoolConfig {
        target_warm_count: 2,
        max_concurrent_provisioning: 4,
        idle_age_threshold: Duration::from_secs(600),
        max_session_duration: Duration::from_secs(60),
        max_usage_per_session: 3,
        replenish_interval: Duration::from_secs(1),
        reaper_interval: Duration::from_secs(1),
        daily_cost_cap: Money::from_cents(10_000),
        flavor: "node-starter".to_string(),
        provision_cost: Money::from_cents(10),
        empty_grace_period: Duration::from_secs(30),
        retire_batch_size: 2,
        budget_alert_threshold: 80,
    }
}
