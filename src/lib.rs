//! Query NVIDIA GPUs through `nvidia-smi` and pick idle ones.
//!
//! ```no_run
//! use gpusel::{GpuFilterSpec, Order};
//! use std::time::Duration;
//!
//! let spec = GpuFilterSpec {
//!     order: Order::Memory,
//!     ..GpuFilterSpec::default()
//! };
//! let ids = gpusel::select_first_available(&spec, 10, Duration::from_secs(60))?;
//! println!("CUDA_VISIBLE_DEVICES={}", ids[0]);
//! # Ok::<(), gpusel::SelectError>(())
//! ```

pub mod config;
pub mod data;
pub mod monitor;
pub mod parse;
pub mod select;
pub mod table;

pub use config::{ConfigError, GpuFilterSpec, Order};
pub use data::{GpuIdMap, GpuProcessRecord, GpuRecord};
pub use monitor::{
    GpuQuery, NvidiaSmi, OwnerLookup, PsOwnerLookup, QueryKind, SnapshotError, TelemetryError,
    TelemetrySource,
};
pub use parse::{parse_gpu_line, parse_or_nan, parse_process_line, ParseError};
pub use select::{filter_availability, poll_until_available, select_from, SelectError};
pub use table::{render_gpu_table, render_process_table};

use std::time::Duration;

// GPU-only queries never read the uuid map, so skip the initial snapshot.
fn gpu_query() -> GpuQuery {
    GpuQuery::with_id_map(
        Box::new(NvidiaSmi::new()),
        Box::new(PsOwnerLookup),
        GpuIdMap::default(),
    )
}

/// Current GPUs as reported by `nvidia-smi`; empty if the query fails.
pub fn gpu_snapshot() -> Vec<GpuRecord> {
    gpu_query().gpu_snapshot()
}

/// Current compute processes; empty if the query fails.
///
/// Each call runs an extra GPU query to capture a fresh uuid to id map.
/// Long-lived callers should build one [`GpuQuery`] and reuse it, so the map
/// is captured once and every snapshot costs a single `nvidia-smi` run.
pub fn gpu_process_snapshot() -> Vec<GpuProcessRecord> {
    GpuQuery::nvidia_smi().process_snapshot()
}

pub fn select_available(spec: &GpuFilterSpec) -> Vec<u32> {
    gpu_query().select_available(spec)
}

pub fn select_first_available(
    spec: &GpuFilterSpec,
    attempts: u32,
    interval: Duration,
) -> Result<Vec<u32>, SelectError> {
    gpu_query().select_first_available(spec, attempts, interval)
}
