use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub type VmRecordId = u64;
pub type UserId = u64;
pub type CourseId = u64;
pub type HypervisorId = u64;

/// Identifier the hypervisor assigned to the VM (Proxmox `vmid`).
pub type BackendVmId = u32;

/// Internal record correlating a hypervisor VM with its owner and course.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachine {
    pub id: VmRecordId,
    pub backend_vm_id: BackendVmId,
    pub name: String,
    pub status: VmStatus,
    pub owner_id: UserId,
    pub course_id: Option<CourseId>,
    pub hypervisor_id: HypervisorId,
    pub details: VmDetailsBag,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to persist a freshly created VM.
#[derive(Debug, Clone)]
pub struct NewVirtualMachine {
    pub backend_vm_id: BackendVmId,
    pub name: String,
    pub status: VmStatus,
    pub owner_id: UserId,
    pub course_id: Option<CourseId>,
    pub hypervisor_id: HypervisorId,
    pub details: VmDetailsBag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Creating,
    DraftTemplate,
    Template,
    Running,
    Stopped,
    Unknown,
}

impl VmStatus {
    /// Whether a record may move from `self` to `next`.
    ///
    /// Clone path: creating -> running/stopped. ISO path: creating ->
    /// draft_template -> template. Templates never leave that state.
    pub fn can_transition_to(self, next: VmStatus) -> bool {
        use VmStatus::*;
        if self == next {
            return self != Template;
        }
        match (self, next) {
            (Creating, Running | Stopped | DraftTemplate | Template | Unknown) => true,
            (DraftTemplate, Template) => true,
            (Running, Stopped | Unknown) => true,
            (Stopped, Running | Unknown) => true,
            (Unknown, Running | Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::Creating => "creating",
            VmStatus::DraftTemplate => "draft_template",
            VmStatus::Template => "template",
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Open key/value metadata attached to a VM record (`node`, `ip`, `iso`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmDetailsBag(BTreeMap<String, Value>);

impl VmDetailsBag {
    pub const NODE: &'static str = "node";
    pub const IP: &'static str = "ip";
    pub const ISO: &'static str = "iso";

    pub fn with_node(node: impl Into<String>) -> Self {
        let mut bag = Self::default();
        bag.set(Self::NODE, node.into());
        bag
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn node(&self) -> Option<&str> {
        self.get_str(Self::NODE)
    }

    pub fn ip(&self) -> Option<&str> {
        self.get_str(Self::IP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_is_terminal() {
        for next in [
            VmStatus::Creating,
            VmStatus::DraftTemplate,
            VmStatus::Running,
            VmStatus::Stopped,
            VmStatus::Unknown,
            VmStatus::Template,
        ] {
            assert!(!VmStatus::Template.can_transition_to(next), "template -> {next}");
        }
    }

    #[test]
    fn iso_path_reaches_template() {
        assert!(VmStatus::Creating.can_transition_to(VmStatus::DraftTemplate));
        assert!(VmStatus::DraftTemplate.can_transition_to(VmStatus::Template));
        assert!(VmStatus::Creating.can_transition_to(VmStatus::Template));
        assert!(!VmStatus::DraftTemplate.can_transition_to(VmStatus::Running));
        assert!(!VmStatus::Running.can_transition_to(VmStatus::Template));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&VmStatus::DraftTemplate).unwrap();
        assert_eq!(json, "\"draft_template\"");
        assert_eq!(VmStatus::DraftTemplate.to_string(), "draft_template");
    }

    #[test]
    fn details_bag_keeps_node() {
        let mut bag = VmDetailsBag::with_node("pve2");
        bag.set(VmDetailsBag::ISO, "local:iso/debian.iso");
        assert_eq!(bag.node(), Some("pve2"));
        assert_eq!(bag.get_str("iso"), Some("local:iso/debian.iso"));
        assert_eq!(bag.ip(), None);
    }
}
