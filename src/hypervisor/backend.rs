use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::client::{TaskState, VmRuntime};
use crate::errors::HypervisorResult;

/// Guest power verbs. `Stop` pulls the plug, `Shutdown` asks the guest OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerAction {
    Start,
    Stop,
    Shutdown,
}

impl PowerAction {
    pub fn verb(self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Shutdown => "shutdown",
        }
    }
}

/// One row of a node's guest listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QemuEntry {
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub template: Option<Value>,
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub maxmem: Option<u64>,
}

impl QemuEntry {
    pub fn is_template(&self) -> bool {
        match &self.template {
            Some(Value::Number(n)) => n.as_u64() == Some(1),
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "1",
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageItem {
    pub volid: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VncTicket {
    pub ticket: String,
    pub port: String,
    pub cert: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloneParams {
    pub new_id: u32,
    pub name: String,
    pub full: bool,
}

/// Parameters for a fresh guest built from installation media.
#[derive(Debug, Clone, PartialEq)]
pub struct QemuCreateParams {
    pub vmid: u32,
    pub name: String,
    pub memory_mib: u64,
    pub sockets: u32,
    pub cores: u32,
    pub net0: String,
    pub scsihw: String,
    pub cdrom: String,
    pub boot: String,
    pub bootdisk: String,
    pub ostype: String,
    pub scsi0: String,
}

impl QemuCreateParams {
    pub fn to_form(&self) -> Vec<(String, String)> {
        vec![
            ("vmid".into(), self.vmid.to_string()),
            ("name".into(), self.name.clone()),
            ("memory".into(), self.memory_mib.to_string()),
            ("sockets".into(), self.sockets.to_string()),
            ("cores".into(), self.cores.to_string()),
            ("net0".into(), self.net0.clone()),
            ("scsihw".into(), self.scsihw.clone()),
            ("ide2".into(), format!("{},media=cdrom", self.cdrom)),
            ("boot".into(), self.boot.clone()),
            ("bootdisk".into(), self.bootdisk.clone()),
            ("ostype".into(), self.ostype.clone()),
            ("scsi0".into(), self.scsi0.clone()),
        ]
    }
}

/// Reads an integer out of a guest config map. Some backend versions send
/// numbers as strings.
pub fn config_number(config: &Map<String, Value>, key: &str) -> Option<u64> {
    match config.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Per-node primitives of a clustered hypervisor.
///
/// Calls that reach a node which does not host the addressed object fail with
/// `BackendOperationFailed`; transport problems fail with
/// `BackendUnreachable`. The locator relies on that split.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Host (and optional port) the management API is served from.
    fn host(&self) -> &str;

    async fn version(&self) -> HypervisorResult<Value>;
    async fn nodes(&self) -> HypervisorResult<Vec<String>>;
    async fn node_status(&self, node: &str) -> HypervisorResult<Value>;

    async fn list_qemu(&self, node: &str) -> HypervisorResult<Vec<QemuEntry>>;
    async fn vm_config(&self, node: &str, vmid: u32) -> HypervisorResult<Map<String, Value>>;
    async fn vm_runtime(&self, node: &str, vmid: u32) -> HypervisorResult<VmRuntime>;
    async fn guest_ipv4(&self, node: &str, vmid: u32) -> HypervisorResult<Option<String>>;

    async fn next_vmid(&self) -> HypervisorResult<u32>;
    async fn clone_vm(
        &self,
        node: &str,
        source: u32,
        params: &CloneParams,
    ) -> HypervisorResult<Option<String>>;
    async fn update_config(
        &self,
        node: &str,
        vmid: u32,
        params: &[(String, String)],
    ) -> HypervisorResult<()>;
    async fn create_qemu(
        &self,
        node: &str,
        params: &QemuCreateParams,
    ) -> HypervisorResult<Option<String>>;
    async fn power(&self, node: &str, vmid: u32, action: PowerAction) -> HypervisorResult<()>;
    async fn make_template(&self, node: &str, vmid: u32) -> HypervisorResult<()>;

    async fn storage_status(&self, node: &str, storage: &str) -> HypervisorResult<Value>;
    async fn list_storage(&self, node: &str) -> HypervisorResult<Vec<String>>;
    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
        content: &str,
    ) -> HypervisorResult<Vec<StorageItem>>;
    async fn download_url(
        &self,
        node: &str,
        storage: &str,
        url: &str,
        filename: &str,
    ) -> HypervisorResult<String>;

    async fn task_status(&self, node: &str, upid: &str) -> HypervisorResult<TaskState>;
    async fn task_log(&self, node: &str, upid: &str) -> HypervisorResult<Vec<String>>;
    async fn stop_task(&self, node: &str, upid: &str) -> HypervisorResult<()>;

    async fn vnc_proxy(&self, node: &str, vmid: u32) -> HypervisorResult<VncTicket>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_flag_variants() {
        let mut entry: QemuEntry =
            serde_json::from_value(json!({"vmid": 100, "name": "ubuntu", "status": "stopped", "template": 1}))
                .unwrap();
        assert!(entry.is_template());
        entry.template = Some(json!(""));
        assert!(!entry.is_template());
        entry.template = None;
        assert!(!entry.is_template());
    }

    #[test]
    fn config_numbers_accept_strings() {
        let config = json!({"cores": 4, "memory": "2048", "name": "x"});
        let map = config.as_object().unwrap();
        assert_eq!(config_number(map, "cores"), Some(4));
        assert_eq!(config_number(map, "memory"), Some(2048));
        assert_eq!(config_number(map, "name"), None);
        assert_eq!(config_number(map, "sockets"), None);
    }

    #[test]
    fn create_form_attaches_media_as_cdrom() {
        let params = QemuCreateParams {
            vmid: 120,
            name: "debian-draft".into(),
            memory_mib: 2048,
            sockets: 1,
            cores: 2,
            net0: "virtio,bridge=vmbr0".into(),
            scsihw: "virtio-scsi-pci".into(),
            cdrom: "local:iso/debian.iso".into(),
            boot: "order=ide2;scsi0;net0".into(),
            bootdisk: "scsi0".into(),
            ostype: "l26".into(),
            scsi0: "local-lvm:32".into(),
        };
        let form = params.to_form();
        assert!(form.contains(&("ide2".into(), "local:iso/debian.iso,media=cdrom".into())));
        assert!(form.contains(&("scsi0".into(), "local-lvm:32".into())));
    }
}
