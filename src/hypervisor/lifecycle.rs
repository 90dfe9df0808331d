/*
* VM Lifecycle Engine
* -------------------
* Drives guests through their life on the cluster:
*
*   clone path:  creating -> running / stopped
*   ISO path:    creating -> draft_template -> template
*
* Every operation resolves the owning node first (see ClusterLocator) and only
* then issues the mutating call against that exact node. Node assignments are
* never remembered between calls.
*
* Composite operations:
* --------------------
* - create_from_template: clone, then best-effort resize. A failed resize is a
*   PartialSuccess: logged, the VM is still returned.
* - convert_to_template: stop, wait (bounded, see RetryPolicy), convert. The
*   wait is best-effort quiescence; conversion is attempted either way.
*/

use std::sync::Arc;

use tracing::{error, info, warn};

use super::backend::{CloneParams, ClusterBackend, PowerAction, QemuCreateParams};
use super::client::{CreatedVm, IsoBuildConfig};
use super::locator::ClusterLocator;
use crate::errors::handlers::{PollOutcome, RetryPolicy};
use crate::errors::{HypervisorError, HypervisorResult, PartialSuccess};

pub const PREFERRED_DISK_POOL: &str = "local-lvm";
pub const FALLBACK_DISK_POOL: &str = "local";
pub const DEFAULT_BRIDGE: &str = "vmbr0";
/// cdrom first so the installer boots, then disk, then network.
pub const ISO_BOOT_ORDER: &str = "order=ide2;scsi0;net0";

/// Result of a template conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateConversion {
    pub node: String,
    /// Whether the guest was seen `stopped` before conversion was issued.
    pub stop_observed: bool,
    pub stop_checks: u32,
}

pub struct VmLifecycleEngine {
    backend: Arc<dyn ClusterBackend>,
    locator: ClusterLocator,
    stop_wait: RetryPolicy,
}

impl VmLifecycleEngine {
    pub fn new(backend: Arc<dyn ClusterBackend>, stop_wait: RetryPolicy) -> Self {
        Self {
            locator: ClusterLocator::new(backend.clone()),
            backend,
            stop_wait,
        }
    }

    pub fn locator(&self) -> &ClusterLocator {
        &self.locator
    }

    /// Full clone of `template_id` onto the template's node.
    pub async fn create_from_template(
        &self,
        name: &str,
        template_id: u32,
        cpu: Option<u32>,
        memory_mib: Option<u64>,
    ) -> HypervisorResult<CreatedVm> {
        let node = self.locator.locate_template(template_id).await?;
        let new_id = self.backend.next_vmid().await?;

        info!(name, template_id, new_id, node = %node, "Cloning template");
        let params = CloneParams {
            new_id,
            name: name.to_string(),
            full: true,
        };
        self.backend.clone_vm(&node, template_id, &params).await?;

        let mut overrides = Vec::new();
        if let Some(cores) = cpu {
            overrides.push(("cores".to_string(), cores.to_string()));
        }
        if let Some(memory) = memory_mib {
            overrides.push(("memory".to_string(), memory.to_string()));
        }
        if !overrides.is_empty() {
            if let Err(e) = self.backend.update_config(&node, new_id, &overrides).await {
                PartialSuccess {
                    vm_id: new_id,
                    node: node.clone(),
                    step: "apply cpu/memory",
                    reason: e.to_string(),
                }
                .log();
            }
        }

        Ok(CreatedVm {
            backend_id: new_id,
            node,
        })
    }

    pub async fn start(&self, vmid: u32) -> HypervisorResult<bool> {
        self.power(vmid, PowerAction::Start).await
    }

    /// Hard power-off.
    pub async fn stop(&self, vmid: u32) -> HypervisorResult<bool> {
        self.power(vmid, PowerAction::Stop).await
    }

    /// Graceful, guest OS initiated.
    pub async fn shutdown(&self, vmid: u32) -> HypervisorResult<bool> {
        self.power(vmid, PowerAction::Shutdown).await
    }

    async fn power(&self, vmid: u32, action: PowerAction) -> HypervisorResult<bool> {
        let node = self.locator.locate_vm(vmid).await?;
        match self.backend.power(&node, vmid, action).await {
            Ok(()) => {
                info!(vmid, node = %node, verb = action.verb(), "Power action accepted");
                Ok(true)
            }
            Err(e) if e.is_rejection() => {
                warn!(vmid, node = %node, verb = action.verb(), error = %e, "Power action refused");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Builds a draft guest that boots the given installation media.
    pub async fn create_from_iso(
        &self,
        name: &str,
        iso_ref: &str,
        config: &IsoBuildConfig,
    ) -> HypervisorResult<CreatedVm> {
        let storage = iso_storage(iso_ref)?;
        let disk_size = normalize_disk_size(&config.disk_size)?;

        let node = match self.locator.locate_storage(storage).await {
            Ok(node) => node,
            Err(HypervisorError::ResourceNotFound(_)) => {
                let first = self.backend.nodes().await?.into_iter().next();
                let node = first.ok_or_else(|| {
                    HypervisorError::ResourceNotFound("no nodes in cluster".to_string())
                })?;
                warn!(storage, node = %node, "ISO storage not found on any node, using first node");
                node
            }
            Err(e) => return Err(e),
        };

        let pool = self.disk_pool(&node).await?;
        let vmid = self.backend.next_vmid().await?;
        let params = QemuCreateParams {
            vmid,
            name: name.to_string(),
            memory_mib: config.memory_mib,
            sockets: 1,
            cores: config.cpu,
            net0: format!("virtio,bridge={DEFAULT_BRIDGE}"),
            scsihw: "virtio-scsi-pci".to_string(),
            cdrom: iso_ref.to_string(),
            boot: ISO_BOOT_ORDER.to_string(),
            bootdisk: "scsi0".to_string(),
            ostype: "l26".to_string(),
            scsi0: format!("{pool}:{disk_size}"),
        };

        info!(name, vmid, node = %node, iso = iso_ref, pool = %pool, "Creating draft VM from ISO");
        self.backend.create_qemu(&node, &params).await?;

        Ok(CreatedVm {
            backend_id: vmid,
            node,
        })
    }

    /// Prefers thin LVM, falls back to directory storage. Only existence is
    /// checked, not free space.
    async fn disk_pool(&self, node: &str) -> HypervisorResult<&'static str> {
        match self.backend.storage_status(node, PREFERRED_DISK_POOL).await {
            Ok(_) => Ok(PREFERRED_DISK_POOL),
            Err(e) if e.is_rejection() => Ok(FALLBACK_DISK_POOL),
            Err(e) => Err(e),
        }
    }

    /// Stops the guest, waits a bounded time for it to report `stopped`, then
    /// flips it into a template. The wait never blocks conversion.
    pub async fn convert_to_template(&self, vmid: u32) -> HypervisorResult<TemplateConversion> {
        let node = self.locator.locate_vm(vmid).await?;

        if let Err(e) = self.backend.power(&node, vmid, PowerAction::Stop).await {
            warn!(vmid, node = %node, error = %e, "Stop before conversion failed, converting anyway");
        }

        let backend = &self.backend;
        let node_ref = node.as_str();
        let outcome = self
            .stop_wait
            .poll_until("guest stopped before template conversion", || async move {
                backend
                    .vm_runtime(node_ref, vmid)
                    .await
                    .map(|rt| rt.status == "stopped")
            })
            .await;

        if let PollOutcome::Exhausted { attempts } = outcome {
            warn!(vmid, attempts, "Guest not observed stopped, converting anyway");
        }

        match self.backend.make_template(&node, vmid).await {
            Ok(()) => {
                info!(vmid, node = %node, "VM converted to template");
                Ok(TemplateConversion {
                    node,
                    stop_observed: outcome.satisfied(),
                    stop_checks: outcome.attempts(),
                })
            }
            Err(e) => {
                error!(vmid, node = %node, error = %e, "Template conversion failed");
                Err(e)
            }
        }
    }
}

/// Storage part of a `storage:iso/file.iso` volume reference.
pub fn iso_storage(iso_ref: &str) -> HypervisorResult<&str> {
    match iso_ref.split_once(':') {
        Some((storage, file)) if !storage.is_empty() && !file.is_empty() => Ok(storage),
        _ => Err(HypervisorError::InvalidRequest(format!(
            "ISO reference '{iso_ref}' must look like storage:iso/file.iso"
        ))),
    }
}

/// Strips a trailing unit suffix (`32G`, `32GB`, `32g` -> `32`).
pub fn normalize_disk_size(raw: &str) -> HypervisorResult<String> {
    let digits = raw.trim().trim_end_matches(|c: char| c.is_ascii_alphabetic());
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(HypervisorError::InvalidRequest(format!(
            "disk size '{raw}' is not a whole number of gigabytes"
        )));
    }
    Ok(digits.to_string())
}
