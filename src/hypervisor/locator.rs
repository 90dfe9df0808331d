use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use super::backend::ClusterBackend;
use crate::errors::{HypervisorError, HypervisorResult};

/// What to look for on each node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe<'a> {
    /// A guest or template by backend id.
    Guest(u32),
    /// A storage pool by name.
    Storage(&'a str),
}

impl fmt::Display for Probe<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Guest(id) => write!(f, "guest {id}"),
            Probe::Storage(name) => write!(f, "storage '{name}'"),
        }
    }
}

/// Finds the node that currently owns a guest or serves a storage pool.
///
/// Nodes are asked one at a time in membership order and the first positive
/// answer wins. Nothing is cached: guests migrate, so callers resolve again
/// before every mutating call.
#[derive(Clone)]
pub struct ClusterLocator {
    backend: Arc<dyn ClusterBackend>,
}

impl ClusterLocator {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }

    pub async fn locate(&self, probe: Probe<'_>) -> HypervisorResult<String> {
        let nodes = self.backend.nodes().await?;
        for node in &nodes {
            let answer = match probe {
                Probe::Guest(vmid) => self.backend.vm_config(node, vmid).await.map(drop),
                Probe::Storage(storage) => self.backend.storage_status(node, storage).await.map(drop),
            };
            match answer {
                Ok(()) => {
                    debug!(%probe, node = %node, "Located on node");
                    return Ok(node.clone());
                }
                // The node answered, it just is not the owner.
                Err(e) if e.is_rejection() => trace!(%probe, node = %node, "Not on node"),
                Err(e) => return Err(e),
            }
        }

        Err(HypervisorError::ResourceNotFound(format!(
            "{probe} (scanned {} nodes)",
            nodes.len()
        )))
    }

    pub async fn locate_vm(&self, vmid: u32) -> HypervisorResult<String> {
        self.locate(Probe::Guest(vmid)).await.map_err(|e| match e {
            HypervisorError::ResourceNotFound(_) => HypervisorError::VmNotFound { vm_id: vmid },
            other => other,
        })
    }

    pub async fn locate_template(&self, template_id: u32) -> HypervisorResult<String> {
        self.locate(Probe::Guest(template_id)).await.map_err(|e| match e {
            HypervisorError::ResourceNotFound(_) => HypervisorError::TemplateNotFound { template_id },
            other => other,
        })
    }

    pub async fn locate_storage(&self, storage: &str) -> HypervisorResult<String> {
        self.locate(Probe::Storage(storage)).await
    }
}
