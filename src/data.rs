use serde::Serialize;
use std::collections::HashMap;

// GPU data structure, one row of `nvidia-smi --query-gpu` output
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GpuRecord {
    pub id: u32,
    pub uuid: String,
    /// Fraction in 0.0..=1.0, NaN when the driver reports `[N/A]`.
    pub load: f64,
    /// `used_memory / total_memory`, NaN when the total is zero.
    pub memory_utilization: f64,
    pub total_memory: f64,
    pub used_memory: f64,
    pub free_memory: f64,
    pub driver_version: String,
    pub name: String,
    pub serial: String,
    pub display_mode: String,
    pub display_active: String,
    pub temperature: f64,
    pub vbios_version: String,
    pub power_draw: f64,
    pub power_limit: f64,
    pub core_clock: Option<u32>,
    pub memory_clock: Option<u32>,
    pub compute_mode: String,
    pub pci_bus: u32,
}

impl GpuRecord {
    pub fn memory_utilization(used: f64, total: f64) -> f64 {
        if total == 0.0 {
            return f64::NAN;
        }
        used / total
    }
}

// Process information structure, one row of `nvidia-smi --query-compute-apps`
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GpuProcessRecord {
    pub pid: u32,
    pub process_name: String,
    /// `None` when the process' GPU uuid was not in the id map.
    pub gpu_id: Option<u32>,
    pub gpu_uuid: String,
    pub gpu_name: String,
    pub used_memory: f64,
    /// `None` when the owner could not be looked up.
    pub owner_uid: Option<u32>,
    pub owner_name: String,
}

/// Mapping from GPU uuid to index, captured once from a GPU snapshot.
///
/// The map is never refreshed by the queries that read it; build a new one
/// with [`GpuIdMap::from_records`] when the device set changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GpuIdMap {
    ids: HashMap<String, u32>,
}

impl GpuIdMap {
    pub fn from_records(gpus: &[GpuRecord]) -> Self {
        Self {
            ids: gpus.iter().map(|gpu| (gpu.uuid.clone(), gpu.id)).collect(),
        }
    }

    pub fn resolve(&self, uuid: &str) -> Option<u32> {
        self.ids.get(uuid).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<(String, u32)> for GpuIdMap {
    fn from_iter<I: IntoIterator<Item = (String, u32)>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}
