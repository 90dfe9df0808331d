use serde::Serialize;
use serde_json::{Map, Value};

use crate::hypervisor::backend::config_number;

pub const USD_PER_CORE_MONTH: f64 = 5.0;
pub const USD_PER_GIB_MONTH: f64 = 2.0;
pub const DEFAULT_CORES: u64 = 1;
pub const DEFAULT_MEMORY_MIB: u64 = 1024;

/// Flat-rate monthly estimate for a VM's allocated size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub monthly_usd: f64,
    pub breakdown: String,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl CostEstimate {
    pub fn for_size(cores: u64, memory_mib: u64) -> Self {
        let cpu = cores as f64 * USD_PER_CORE_MONTH;
        let ram = round2(memory_mib as f64 / 1024.0 * USD_PER_GIB_MONTH);
        Self {
            monthly_usd: round2(cpu + ram),
            breakdown: format!("${cpu:.2} (CPU) + ${ram:.2} (RAM)"),
        }
    }

    /// Reads `cores` and `memory` from a guest config, defaulting whatever is
    /// missing.
    pub fn from_config(config: &Map<String, Value>) -> Self {
        Self::for_size(
            config_number(config, "cores").unwrap_or(DEFAULT_CORES),
            config_number(config, "memory").unwrap_or(DEFAULT_MEMORY_MIB),
        )
    }
}
