//! Availability filtering, ordering and polling selection.

use crate::config::{GpuFilterSpec, Order};
use crate::data::GpuRecord;
use crate::monitor::GpuQuery;
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error(
        "could not find an available GPU after {attempts} attempts with {} seconds interval",
        .interval.as_secs_f64()
    )]
    NoAvailableGpu { attempts: u32, interval: Duration },
    #[error("attempts must be at least 1")]
    InvalidAttempts,
}

/// One flag per GPU, in input order: `true` when the GPU passes every threshold
/// and exclusion in `spec`.
pub fn filter_availability(gpus: &[GpuRecord], spec: &GpuFilterSpec) -> Vec<bool> {
    gpus.iter().map(|gpu| is_available(gpu, spec)).collect()
}

fn is_available(gpu: &GpuRecord, spec: &GpuFilterSpec) -> bool {
    let below = |value: f64, max: f64| value < max || (spec.include_nan && value.is_nan());

    gpu.free_memory >= spec.min_free_memory
        && below(gpu.load, spec.max_load)
        && below(gpu.memory_utilization, spec.max_memory_utilization)
        && !spec.exclude_ids.contains(&gpu.id)
        && !spec.exclude_uuids.contains(&gpu.uuid)
        && !spec.exclude_compute_modes.contains(&gpu.compute_mode)
}

// NaN sorts after every number.
fn nan_last(a: f64, b: f64) -> Ordering {
    let key = |v: f64| if v.is_nan() { f64::INFINITY } else { v };
    key(a).total_cmp(&key(b))
}

pub fn order_candidates<R: Rng + ?Sized>(gpus: &mut [GpuRecord], order: Order, rng: &mut R) {
    match order {
        Order::First => gpus.sort_by_key(|gpu| gpu.id),
        Order::Last => gpus.sort_by(|a, b| b.id.cmp(&a.id)),
        Order::Random => gpus.shuffle(rng),
        Order::Load => gpus.sort_by(|a, b| nan_last(a.load, b.load)),
        Order::Memory => {
            gpus.sort_by(|a, b| nan_last(a.memory_utilization, b.memory_utilization))
        }
    }
}

/// Applies `spec` to an existing snapshot and returns the selected ids.
pub fn select_from(gpus: Vec<GpuRecord>, spec: &GpuFilterSpec) -> Vec<u32> {
    select_from_with_rng(gpus, spec, &mut rand::thread_rng())
}

pub fn select_from_with_rng<R: Rng + ?Sized>(
    gpus: Vec<GpuRecord>,
    spec: &GpuFilterSpec,
    rng: &mut R,
) -> Vec<u32> {
    let total = gpus.len();
    let mut candidates: Vec<GpuRecord> = gpus
        .into_iter()
        .filter(|gpu| is_available(gpu, spec))
        .collect();
    debug!(total, available = candidates.len(), order = ?spec.order, "filtered GPUs");

    order_candidates(&mut candidates, spec.order, rng);
    candidates.truncate(spec.limit);
    candidates.into_iter().map(|gpu| gpu.id).collect()
}

/// Calls `select` up to `attempts` times, sleeping `interval` between empty
/// results. Returns the first non-empty result without a trailing sleep.
pub fn poll_until_available<F, S>(
    attempts: u32,
    interval: Duration,
    mut select: F,
    mut sleep: S,
) -> Result<Vec<u32>, SelectError>
where
    F: FnMut() -> Vec<u32>,
    S: FnMut(Duration),
{
    if attempts == 0 {
        return Err(SelectError::InvalidAttempts);
    }

    for attempt in 1..=attempts {
        info!("Attempting ({attempt}/{attempts}) to locate available GPU.");
        let found = select();
        if !found.is_empty() {
            info!("GPU {found:?} located!");
            return Ok(found);
        }
        if attempt < attempts {
            sleep(interval);
        }
    }

    Err(SelectError::NoAvailableGpu { attempts, interval })
}

impl GpuQuery {
    /// Takes a fresh snapshot and returns the ids selected by `spec`.
    pub fn select_available(&self, spec: &GpuFilterSpec) -> Vec<u32> {
        select_from(self.gpu_snapshot(), spec)
    }

    /// Polls for a single available GPU; `spec.limit` is ignored.
    pub fn select_first_available(
        &self,
        spec: &GpuFilterSpec,
        attempts: u32,
        interval: Duration,
    ) -> Result<Vec<u32>, SelectError> {
        let spec = GpuFilterSpec {
            limit: 1,
            ..spec.clone()
        };
        poll_until_available(
            attempts,
            interval,
            || self.select_available(&spec),
            std::thread::sleep,
        )
    }
}
