//! Provisioner backed by a remote sandbox server's session API.
//!
//! The remote side speaks the session protocol: `POST /sessions` creates a
//! sandbox and returns `{"session_id": ...}`, `GET /sessions/:id` describes it
//! and `DELETE /sessions/:id` tears it down.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProvisionError;
use crate::provisioner::{Provisioner, SandboxHandle};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment variable carrying the flavor into the remote sandbox.
pub const FLAVOR_ENV: &str = "WARMPOOL_FLAVOR";

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    env: HashMap<&'a str, &'a str>,
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

pub struct HttpProvisioner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProvisioner {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn session_url(&self, id: &str) -> String {
        format!("{}/sessions/{}", self.base_url, id)
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn create(&self, flavor: &str) -> Result<SandboxHandle, ProvisionError> {
        let body = CreateSessionRequest {
            env: HashMap::from([(FLAVOR_ENV, flavor)]),
        };
        let response = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProvisionError::CreateFailed(format!("{status}: {text}")));
        }
        let created: CreateSessionResponse = response.json().await?;
        debug!(sandbox_id = %created.session_id, flavor, "remote sandbox created");

        Ok(SandboxHandle {
            endpoint: self.session_url(&created.session_id),
            id: created.session_id,
            flavor: flavor.to_string(),
        })
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), ProvisionError> {
        let response = self.client.delete(self.session_url(sandbox_id)).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            // Already gone.
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(ProvisionError::DestroyFailed {
                id: sandbox_id.to_string(),
                reason: status.to_string(),
            }),
        }
    }

    async fn health_check(&self, sandbox_id: &str) -> bool {
        let result = self
            .client
            .get(self.session_url(sandbox_id))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(sandbox_id, error = %e, "health probe failed");
                false
            }
        }
    }
}
