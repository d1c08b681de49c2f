//! Warmpool - keeps a pool of pre-provisioned sandboxes warm and leases them
//! out as short, usage-capped sessions.
//!
//! [`pool::PoolManager`] owns all pool state. [`replenish::Replenisher`] and
//! [`reaper::Reaper`] run beside it as background loops, and
//! [`http_server`] exposes it over HTTP.

pub mod config;
pub mod error;
pub mod fakes;
pub mod http_server;
pub mod ledger;
pub mod pool;
pub mod provisioner;
pub mod reaper;
pub mod remote;
pub mod replenish;
#[cfg(target_os = "linux")]
pub mod sandbox;
pub mod state;

pub use config::PoolConfig;
pub use error::{PoolError, ProvisionError};
pub use ledger::{CostLedger, DailyLedger, Money};
pub use pool::PoolManager;
pub use provisioner::{Provisioner, SandboxHandle};
