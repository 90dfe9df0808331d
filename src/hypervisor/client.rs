use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::HypervisorResult;

/// Reachability report. A health probe, so it never errors.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendStatus {
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VmSummary {
    pub vmid: u32,
    pub name: Option<String>,
    pub status: String,
    pub node: String,
    pub template: bool,
    pub cpus: Option<u32>,
    pub maxmem: Option<u64>,
}

/// Live counters of a guest as reported by its node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmRuntime {
    pub status: String,
    pub uptime: u64,
    pub cpu: f64,
    pub mem: u64,
    pub maxmem: u64,
    pub netin: u64,
    pub netout: u64,
    pub diskread: u64,
    pub diskwrite: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VmDetails {
    pub node: String,
    pub config: Map<String, Value>,
    pub status: VmRuntime,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VmStats {
    pub status: String,
    pub uptime_seconds: u64,
    pub cpu_usage_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub network_in_bytes: u64,
    pub network_out_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

impl From<&VmRuntime> for VmStats {
    fn from(rt: &VmRuntime) -> Self {
        Self {
            status: if rt.status.is_empty() {
                "unknown".to_string()
            } else {
                rt.status.clone()
            },
            uptime_seconds: rt.uptime,
            cpu_usage_percent: rt.cpu * 100.0,
            memory_used_bytes: rt.mem,
            memory_total_bytes: rt.maxmem,
            network_in_bytes: rt.netin,
            network_out_bytes: rt.netout,
            disk_read_bytes: rt.diskread,
            disk_write_bytes: rt.diskwrite,
        }
    }
}

/// Short-lived VNC credentials for a guest console.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConsoleTicket {
    pub ticket: String,
    pub port: String,
    pub cert: Option<String>,
    pub node: String,
    pub host: String,
}

/// `host:port`, keeping a port `host` already names. A bare IPv6 literal is
/// bracketed before the port goes on.
pub fn with_default_port(host: &str, port: u16) -> String {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((_, tail)) if tail.starts_with(':') => host.to_string(),
            _ => format!("{host}:{port}"),
        };
    }
    match host.matches(':').count() {
        0 => format!("{host}:{port}"),
        1 => host.to_string(),
        _ => format!("[{host}]:{port}"),
    }
}

impl ConsoleTicket {
    pub const DEFAULT_CONSOLE_PORT: u16 = 8006;

    /// Browser URL opening the noVNC console straight on the hypervisor.
    pub fn direct_url(&self, vmid: u32) -> String {
        let host = with_default_port(&self.host, Self::DEFAULT_CONSOLE_PORT);
        format!(
            "https://{host}/?console=kvm&novnc=1&vmid={vmid}&node={}",
            self.node
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IsoImage {
    pub volid: String,
    pub node: String,
    pub storage: String,
    pub size: Option<u64>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClusterAnalytics {
    pub nodes: Vec<Value>,
}

/// Where a freshly created guest landed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedVm {
    pub backend_id: u32,
    pub node: String,
}

/// Clone-from-template request. Missing sizes keep whatever the template has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub template_id: u32,
    pub cpu: Option<u32>,
    pub memory_mib: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoBuildConfig {
    pub cpu: u32,
    pub memory_mib: u64,
    /// Disk size with or without a unit suffix, e.g. `32G` or `32`.
    pub disk_size: String,
}

/// Raw status of a long-running backend task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitstatus: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Everything the orchestration layer needs from a virtualization backend.
///
/// Errors are always one of the `HypervisorError` kinds. Operations that
/// return `bool` answer `Ok(false)` when the backend was reached and refused,
/// and `Err` when it could not be reached or the target does not exist.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    async fn status(&self) -> BackendStatus;

    async fn list_vms(&self) -> HypervisorResult<Vec<VmSummary>>;
    async fn list_templates(&self) -> HypervisorResult<Vec<VmSummary>>;
    async fn vm_details(&self, vmid: u32) -> HypervisorResult<VmDetails>;

    async fn create_vm(&self, name: &str, request: &CloneRequest) -> HypervisorResult<CreatedVm>;
    async fn start_vm(&self, vmid: u32) -> HypervisorResult<bool>;
    async fn stop_vm(&self, vmid: u32) -> HypervisorResult<bool>;
    async fn shutdown_vm(&self, vmid: u32) -> HypervisorResult<bool>;

    async fn analytics(&self) -> HypervisorResult<ClusterAnalytics>;
    async fn vm_stats(&self, vmid: u32) -> HypervisorResult<VmStats>;
    async fn console_ticket(&self, vmid: u32) -> HypervisorResult<ConsoleTicket>;

    async fn list_isos(&self) -> HypervisorResult<Vec<IsoImage>>;
    async fn create_vm_from_iso(
        &self,
        name: &str,
        iso_ref: &str,
        config: &IsoBuildConfig,
    ) -> HypervisorResult<CreatedVm>;
    async fn convert_to_template(&self, vmid: u32) -> HypervisorResult<bool>;

    async fn download_iso(&self, url: &str, file_name: &str, storage: &str)
        -> HypervisorResult<String>;
    async fn task_status(&self, upid: &str, node: &str) -> HypervisorResult<TaskState>;
    async fn task_log(&self, upid: &str, node: &str) -> HypervisorResult<Vec<String>>;
    async fn cancel_task(&self, upid: &str, node: &str) -> HypervisorResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(host: &str) -> ConsoleTicket {
        ConsoleTicket {
            ticket: "PVEVNC:abc".into(),
            port: "5900".into(),
            cert: None,
            node: "pve2".into(),
            host: host.into(),
        }
    }

    #[test]
    fn direct_url_appends_default_port() {
        assert_eq!(
            ticket("10.0.0.5").direct_url(105),
            "https://10.0.0.5:8006/?console=kvm&novnc=1&vmid=105&node=pve2"
        );
    }

    #[test]
    fn direct_url_keeps_explicit_port() {
        assert_eq!(
            ticket("pve.lab.local:443").direct_url(7),
            "https://pve.lab.local:443/?console=kvm&novnc=1&vmid=7&node=pve2"
        );
    }

    #[test]
    fn direct_url_handles_ipv6_hosts() {
        assert_eq!(
            ticket("[fd00::1]").direct_url(7),
            "https://[fd00::1]:8006/?console=kvm&novnc=1&vmid=7&node=pve2"
        );
        assert_eq!(
            ticket("[fd00::1]:8443").direct_url(7),
            "https://[fd00::1]:8443/?console=kvm&novnc=1&vmid=7&node=pve2"
        );
        assert_eq!(
            ticket("fd00::1").direct_url(7),
            "https://[fd00::1]:8006/?console=kvm&novnc=1&vmid=7&node=pve2"
        );
    }

    #[test]
    fn stats_scale_cpu_fraction() {
        let rt = VmRuntime {
            status: "running".into(),
            cpu: 0.25,
            mem: 512,
            maxmem: 1024,
            ..Default::default()
        };
        let stats = VmStats::from(&rt);
        assert_eq!(stats.cpu_usage_percent, 25.0);
        assert_eq!(stats.memory_total_bytes, 1024);
        assert_eq!(VmStats::from(&VmRuntime::default()).status, "unknown");
    }

    #[test]
    fn task_state_keeps_unknown_fields() {
        let state: TaskState = serde_json::from_value(serde_json::json!({
            "status": "stopped",
            "exitstatus": "OK",
            "type": "download",
            "pid": 4242
        }))
        .unwrap();
        assert!(!state.is_running());
        assert_eq!(state.exitstatus.as_deref(), Some("OK"));
        assert_eq!(state.extra.get("type").and_then(Value::as_str), Some("download"));
    }
}
