use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

pub const EXCLUSIVE_PROCESS: &str = "Exclusive_Process";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid filter config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid filter config: {0}")]
    Invalid(String),
}

/// Ordering applied to available GPUs before the result is truncated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Lowest index first
    #[default]
    First,
    /// Highest index first
    Last,
    /// Uniformly shuffled
    Random,
    /// Lowest load first
    Load,
    /// Lowest memory utilization first
    Memory,
}

/// Thresholds and exclusions deciding which GPUs count as available.
///
/// Every field has a default, so a JSON config only needs the keys it
/// changes:
///
/// ```json
/// { "order": "memory", "limit": 2, "exclude_ids": [0] }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GpuFilterSpec {
    pub order: Order,
    /// Upper bound on the number of ids returned.
    pub limit: usize,
    /// Loads strictly below this fraction qualify.
    pub max_load: f64,
    /// Memory utilizations strictly below this fraction qualify.
    pub max_memory_utilization: f64,
    /// Free memory, in the unit `nvidia-smi` reports (MiB).
    pub min_free_memory: f64,
    /// Treat NaN load or memory utilization as available.
    pub include_nan: bool,
    pub exclude_ids: BTreeSet<u32>,
    pub exclude_uuids: BTreeSet<String>,
    pub exclude_compute_modes: BTreeSet<String>,
}

impl Default for GpuFilterSpec {
    fn default() -> Self {
        Self {
            order: Order::First,
            limit: 1,
            max_load: 0.5,
            max_memory_utilization: 0.5,
            min_free_memory: 0.0,
            include_nan: false,
            exclude_ids: BTreeSet::new(),
            exclude_uuids: BTreeSet::new(),
            exclude_compute_modes: BTreeSet::from([EXCLUSIVE_PROCESS.to_string()]),
        }
    }
}

impl GpuFilterSpec {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let spec: Self = serde_json::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::Invalid("limit must be at least 1".to_string()));
        }
        for (name, value) in [
            ("max_load", self.max_load),
            ("max_memory_utilization", self.max_memory_utilization),
            ("min_free_memory", self.min_free_memory),
        ] {
            if value.is_nan() {
                return Err(ConfigError::Invalid(format!("{name} must be a number")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_exclude_exclusive_process() {
        let spec = GpuFilterSpec::default();
        assert_eq!(spec.order, Order::First);
        assert_eq!(spec.limit, 1);
        assert_eq!(spec.max_load, 0.5);
        assert_eq!(spec.max_memory_utilization, 0.5);
        assert!(spec.exclude_compute_modes.contains(EXCLUSIVE_PROCESS));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let spec = GpuFilterSpec::from_json(r#"{"order": "load", "limit": 3, "exclude_ids": [1, 2]}"#)
            .unwrap();
        assert_eq!(spec.order, Order::Load);
        assert_eq!(spec.limit, 3);
        assert_eq!(spec.exclude_ids, BTreeSet::from([1, 2]));
        assert_eq!(spec.max_load, 0.5);
        assert!(spec.exclude_compute_modes.contains(EXCLUSIVE_PROCESS));
    }

    #[test]
    fn rejects_zero_limit_and_unknown_keys() {
        assert!(matches!(
            GpuFilterSpec::from_json(r#"{"limit": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            GpuFilterSpec::from_json(r#"{"maxLoad": 0.2}"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"order": "random", "include_nan": true}}"#).unwrap();
        let spec = GpuFilterSpec::load(file.path()).unwrap();
        assert_eq!(spec.order, Order::Random);
        assert!(spec.include_nan);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = GpuFilterSpec::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
