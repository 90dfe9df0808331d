//! Proxmox VE adapter.
//!
//! `ProxmoxApi` speaks the REST dialect; everything above it works against
//! the generic `ClusterBackend` trait.

pub mod api;

pub use api::{host_from_url, ProxmoxApi, ProxmoxAuth, DEFAULT_API_PORT};
