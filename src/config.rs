//! Fabric Configuration
//!
//! Tunables for timeouts, failover bounds and transport retries. Every field has a
//! default, so a config file only needs to name what it overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Bound on any cross-node request/response exchange.
    pub request_timeout_ms: u64,
    /// Bound on an undeploy call waiting for every stop confirmation.
    pub undeploy_timeout_ms: u64,
    /// Bound on a single service instance finishing its `execute` after cancel.
    pub service_stop_timeout_ms: u64,
    /// How many times one job may be failed over before its error becomes terminal.
    pub max_failover_attempts: u32,
    /// How long a finished coordinator keeps listening for cancelled jobs to report.
    pub cancel_ack_timeout_ms: u64,
    /// Maximum remembered cancellations for jobs that have not arrived yet.
    pub tombstone_capacity: usize,
    pub http_retry_attempts: usize,
    pub http_timeout_ms: u64,
    /// Checkpoint store used when a request carries no store selector.
    pub default_checkpoint_store: String,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            undeploy_timeout_ms: 10_000,
            service_stop_timeout_ms: 5_000,
            max_failover_attempts: 5,
            cancel_ack_timeout_ms: 2_000,
            tombstone_capacity: 10_000,
            http_retry_attempts: 3,
            http_timeout_ms: 500,
            default_checkpoint_store: "default".to_string(),
        }
    }
}

impl FabricConfig {
    /// Loads a JSON config file; missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn undeploy_timeout(&self) -> Duration {
        Duration::from_millis(self.undeploy_timeout_ms)
    }

    pub fn service_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.service_stop_timeout_ms)
    }

    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}
