use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::backend::ClusterBackend;
use super::client::{
    BackendStatus, CloneRequest, ClusterAnalytics, ConsoleTicket, CreatedVm, HypervisorClient,
    IsoBuildConfig, IsoImage, TaskState, VmDetails, VmStats, VmSummary,
};
use super::lifecycle::VmLifecycleEngine;
use crate::errors::handlers::RetryPolicy;
use crate::errors::{HypervisorError, HypervisorResult};

/// `HypervisorClient` for any clustered backend that exposes the per-node
/// primitives of [`ClusterBackend`].
pub struct ClusterClient {
    backend: Arc<dyn ClusterBackend>,
    engine: VmLifecycleEngine,
}

impl ClusterClient {
    pub fn new(backend: Arc<dyn ClusterBackend>, stop_wait: RetryPolicy) -> Self {
        Self {
            engine: VmLifecycleEngine::new(backend.clone(), stop_wait),
            backend,
        }
    }

    pub fn engine(&self) -> &VmLifecycleEngine {
        &self.engine
    }

    async fn guests(&self, templates: bool) -> HypervisorResult<Vec<VmSummary>> {
        let mut found = Vec::new();
        for node in self.backend.nodes().await? {
            for entry in self.backend.list_qemu(&node).await? {
                if entry.is_template() != templates {
                    continue;
                }
                found.push(VmSummary {
                    template: entry.is_template(),
                    vmid: entry.vmid,
                    name: entry.name,
                    status: entry.status,
                    node: node.clone(),
                    cpus: entry.cpus,
                    maxmem: entry.maxmem,
                });
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl HypervisorClient for ClusterClient {
    async fn status(&self) -> BackendStatus {
        match self.backend.version().await {
            Ok(version) => BackendStatus {
                online: true,
                version: Some(version),
                details: None,
            },
            Err(e) => BackendStatus {
                online: false,
                version: None,
                details: Some(e.to_string()),
            },
        }
    }

    async fn list_vms(&self) -> HypervisorResult<Vec<VmSummary>> {
        self.guests(false).await
    }

    async fn list_templates(&self) -> HypervisorResult<Vec<VmSummary>> {
        self.guests(true).await
    }

    async fn vm_details(&self, vmid: u32) -> HypervisorResult<VmDetails> {
        let node = self.engine.locator().locate_vm(vmid).await?;
        let status = self.backend.vm_runtime(&node, vmid).await?;
        let config = self.backend.vm_config(&node, vmid).await?;
        // The guest agent is optional; no agent simply means no address.
        let ip = match self.backend.guest_ipv4(&node, vmid).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!(vmid, error = %e, "Could not query guest agent for address");
                None
            }
        };
        Ok(VmDetails {
            node,
            config,
            status,
            ip,
        })
    }

    async fn create_vm(&self, name: &str, request: &CloneRequest) -> HypervisorResult<CreatedVm> {
        self.engine
            .create_from_template(name, request.template_id, request.cpu, request.memory_mib)
            .await
    }

    async fn start_vm(&self, vmid: u32) -> HypervisorResult<bool> {
        self.engine.start(vmid).await
    }

    async fn stop_vm(&self, vmid: u32) -> HypervisorResult<bool> {
        self.engine.stop(vmid).await
    }

    async fn shutdown_vm(&self, vmid: u32) -> HypervisorResult<bool> {
        self.engine.shutdown(vmid).await
    }

    async fn analytics(&self) -> HypervisorResult<ClusterAnalytics> {
        let mut nodes = Vec::new();
        for node in self.backend.nodes().await? {
            nodes.push(self.backend.node_status(&node).await?);
        }
        Ok(ClusterAnalytics { nodes })
    }

    async fn vm_stats(&self, vmid: u32) -> HypervisorResult<VmStats> {
        let node = self.engine.locator().locate_vm(vmid).await?;
        let runtime = self.backend.vm_runtime(&node, vmid).await?;
        Ok(VmStats::from(&runtime))
    }

    async fn console_ticket(&self, vmid: u32) -> HypervisorResult<ConsoleTicket> {
        let node = self.engine.locator().locate_vm(vmid).await?;
        let vnc = self.backend.vnc_proxy(&node, vmid).await?;
        if vnc.ticket.is_empty() {
            return Err(HypervisorError::operation_failed(
                "vncproxy",
                "backend returned an empty ticket",
            ));
        }
        Ok(ConsoleTicket {
            ticket: vnc.ticket,
            port: vnc.port,
            cert: vnc.cert,
            node,
            host: self.backend.host().to_string(),
        })
    }

    async fn list_isos(&self) -> HypervisorResult<Vec<IsoImage>> {
        let mut isos = Vec::new();
        for node in self.backend.nodes().await? {
            let storages = match self.backend.list_storage(&node).await {
                Ok(storages) => storages,
                Err(e) if e.is_rejection() => {
                    warn!(node = %node, error = %e, "Skipping node while listing ISOs");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for storage in storages {
                let items = match self.backend.storage_content(&node, &storage, "iso").await {
                    Ok(items) => items,
                    // Storage pools that cannot hold ISOs refuse the content filter.
                    Err(e) if e.is_rejection() => continue,
                    Err(e) => return Err(e),
                };
                isos.extend(items.into_iter().map(|item| IsoImage {
                    volid: item.volid,
                    node: node.clone(),
                    storage: storage.clone(),
                    size: item.size,
                    format: item.format,
                }));
            }
        }
        Ok(isos)
    }

    async fn create_vm_from_iso(
        &self,
        name: &str,
        iso_ref: &str,
        config: &IsoBuildConfig,
    ) -> HypervisorResult<CreatedVm> {
        self.engine.create_from_iso(name, iso_ref, config).await
    }

    async fn convert_to_template(&self, vmid: u32) -> HypervisorResult<bool> {
        match self.engine.convert_to_template(vmid).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_rejection() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn download_iso(
        &self,
        url: &str,
        file_name: &str,
        storage: &str,
    ) -> HypervisorResult<String> {
        let node = self.engine.locator().locate_storage(storage).await?;
        crate::with_context!(
            self.backend.download_url(&node, storage, url, file_name).await,
            "start ISO download"
        )
    }

    async fn task_status(&self, upid: &str, node: &str) -> HypervisorResult<TaskState> {
        self.backend.task_status(node, upid).await
    }

    async fn task_log(&self, upid: &str, node: &str) -> HypervisorResult<Vec<String>> {
        self.backend.task_log(node, upid).await
    }

    async fn cancel_task(&self, upid: &str, node: &str) -> HypervisorResult<bool> {
        match self.backend.stop_task(node, upid).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_rejection() => {
                warn!(upid, node, error = %e, "Task cancellation refused");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
