//! Hypervisor access.
//!
//! `HypervisorClient` is the contract the rest of the crate uses. The Proxmox
//! adapter implements the lower-level `ClusterBackend`, and `ClusterClient`
//! builds the full client on top of it via the locator and lifecycle engine.

pub mod backend;
pub mod client;
pub mod cluster;
pub mod lifecycle;
pub mod locator;
pub mod manager;
pub mod proxmox;
pub mod tasks;

pub use backend::{ClusterBackend, PowerAction};
pub use client::{
    BackendStatus, CloneRequest, ClusterAnalytics, ConsoleTicket, CreatedVm, HypervisorClient,
    IsoBuildConfig, IsoImage, TaskState, VmDetails, VmStats, VmSummary,
};
pub use cluster::ClusterClient;
pub use lifecycle::{TemplateConversion, VmLifecycleEngine};
pub use locator::{ClusterLocator, Probe};
pub use manager::{HypervisorKind, HypervisorManager, HypervisorRecord};
pub use tasks::{TaskHandle, TaskProgress, TaskTracker};
