pub mod access;
pub mod api;
pub mod billing;
pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod hypervisor;
pub mod logging;
pub mod provisioning;
pub mod repository;
pub mod service;
pub mod users;

// Re-exports
pub use api::routes::{create_router, AppState};
pub use config::Settings;
pub use errors::{HypervisorError, LabError};
pub use hypervisor::{HypervisorClient, HypervisorManager};
pub use provisioning::ProvisioningOrchestrator;
pub use service::LabService;
