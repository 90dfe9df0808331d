use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::client::HypervisorClient;
use super::cluster::ClusterClient;
use super::proxmox::{ProxmoxApi, ProxmoxAuth};
use crate::errors::handlers::RetryPolicy;
use crate::errors::{HypervisorError, HypervisorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorKind {
    Proxmox,
}

/// Stored connection data for one managed cluster.
#[derive(Clone, Serialize, Deserialize)]
pub struct HypervisorRecord {
    pub id: u64,
    pub name: String,
    pub kind: HypervisorKind,
    pub url: String,
    pub auth_user: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    #[serde(default)]
    pub verify_ssl: bool,
}

impl std::fmt::Debug for HypervisorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("auth_user", &self.auth_user)
            .field("verify_ssl", &self.verify_ssl)
            .finish_non_exhaustive()
    }
}

/// Turns connection records into ready-to-use clients.
#[derive(Debug, Clone)]
pub struct HypervisorManager {
    request_timeout: Duration,
    stop_wait: RetryPolicy,
}

impl HypervisorManager {
    pub fn new(request_timeout: Duration, stop_wait: RetryPolicy) -> Self {
        Self {
            request_timeout,
            stop_wait,
        }
    }

    pub fn connect(&self, record: &HypervisorRecord) -> HypervisorResult<Arc<dyn HypervisorClient>> {
        if record.auth_user.trim().is_empty() {
            return Err(HypervisorError::InvalidRequest(format!(
                "hypervisor '{}' has no API user configured",
                record.name
            )));
        }

        match record.kind {
            HypervisorKind::Proxmox => {
                let auth = ProxmoxAuth::from_credentials(&record.auth_user, &record.auth_token);
                let api = ProxmoxApi::new(&record.url, auth, record.verify_ssl, self.request_timeout)?;
                info!(hypervisor = %record.name, id = record.id, "Connected Proxmox backend");
                Ok(Arc::new(ClusterClient::new(Arc::new(api), self.stop_wait)))
            }
        }
    }
}
