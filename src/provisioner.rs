//! The boundary to whatever actually creates and tears down sandboxes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// A provisioned sandbox as reported by a [`Provisioner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Provisioner-assigned identifier.
    pub id: String,
    /// Where a session holder reaches the sandbox.
    pub endpoint: String,
    pub flavor: String,
}

/// Creates, destroys and probes sandboxes.
///
/// `create` may take seconds and is called concurrently, bounded by
/// `max_concurrent_provisioning`. `destroy` must be idempotent.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create(&self, flavor: &str) -> Result<SandboxHandle, ProvisionError>;

    async fn destroy(&self, sandbox_id: &str) -> Result<(), ProvisionError>;

    async fn health_check(&self, sandbox_id: &str) -> bool;
}
