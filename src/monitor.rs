use crate::data::{GpuIdMap, GpuProcessRecord, GpuRecord};
use crate::parse::{self, ParseError, GPU_QUERY_FIELDS, PROCESS_QUERY_FIELDS};
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

pub const NVIDIA_SMI: &str = "nvidia-smi";
pub const PROGRAM_ENV: &str = "GPUSEL_NVIDIA_SMI";

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} produced output that is not valid UTF-8")]
    InvalidUtf8 { program: String },
    #[error("{0} not found")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("malformed line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: ParseError,
    },
}

/// Which `nvidia-smi` table to query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    Gpus,
    ComputeApps,
}

impl QueryKind {
    fn flag(self) -> &'static str {
        match self {
            QueryKind::Gpus => "--query-gpu",
            QueryKind::ComputeApps => "--query-compute-apps",
        }
    }

    fn fields(self) -> &'static [&'static str] {
        match self {
            QueryKind::Gpus => &GPU_QUERY_FIELDS,
            QueryKind::ComputeApps => &PROCESS_QUERY_FIELDS,
        }
    }
}

/// Source of raw telemetry text, one CSV row per device or process.
#[cfg_attr(test, automock)]
pub trait TelemetrySource {
    fn query(&self, kind: QueryKind) -> Result<String, TelemetryError>;
}

/// Resolves the real user owning a process.
#[cfg_attr(test, automock)]
pub trait OwnerLookup {
    fn owner(&self, pid: u32) -> Option<(u32, String)>;
}

pub struct NvidiaSmi {
    program: PathBuf,
}

impl NvidiaSmi {
    /// Locates the binary for the current platform, honouring `GPUSEL_NVIDIA_SMI`.
    pub fn new() -> Self {
        let program = std::env::var_os(PROGRAM_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_program);
        Self { program }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
fn default_program() -> PathBuf {
    let exe = format!("{NVIDIA_SMI}.exe");
    if let Some(found) = search_path(&exe) {
        return found;
    }
    let drive = std::env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string());
    PathBuf::from(format!(
        "{drive}\\Program Files\\NVIDIA Corporation\\NVSMI\\{exe}"
    ))
}

#[cfg(not(windows))]
fn default_program() -> PathBuf {
    PathBuf::from(NVIDIA_SMI)
}

#[cfg_attr(not(windows), allow(dead_code))]
fn search_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

impl TelemetrySource for NvidiaSmi {
    fn query(&self, kind: QueryKind) -> Result<String, TelemetryError> {
        let program = self.program.display().to_string();
        let query = format!("{}={}", kind.flag(), kind.fields().join(","));
        debug!(%program, %query, "running telemetry query");

        let output = Command::new(&self.program)
            .args([query.as_str(), "--format=csv,noheader,nounits"])
            .output()
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => TelemetryError::NotFound(program.clone()),
                _ => TelemetryError::Spawn {
                    program: program.clone(),
                    source,
                },
            })?;

        // A failing exit status still leaves usable rows on stdout in some
        // driver states, so only report it.
        if !output.status.success() {
            warn!(
                %program,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "telemetry query exited unsuccessfully"
            );
        }

        String::from_utf8(output.stdout).map_err(|_| TelemetryError::InvalidUtf8 { program })
    }
}

/// Owner lookup through `ps -p<pid> -oruid=,ruser=`.
pub struct PsOwnerLookup;

impl OwnerLookup for PsOwnerLookup {
    fn owner(&self, pid: u32) -> Option<(u32, String)> {
        let output = Command::new("ps")
            .args([format!("-p{pid}"), "-oruid=,ruser=".to_string()])
            .output()
            .ok()?;
        parse_ps_owner(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_ps_owner(stdout: &str) -> Option<(u32, String)> {
    let mut parts = stdout.split_whitespace();
    let uid = parts.next()?.parse().ok()?;
    let name = parts.next()?.to_string();
    match parts.next() {
        None => Some((uid, name)),
        Some(_) => None,
    }
}

/// Row lines of a CSV dump, without the empty tail left by the final terminator.
pub fn output_lines(stdout: &str) -> impl Iterator<Item = &str> {
    stdout.lines()
}

/// Queries and parses snapshots through a [`TelemetrySource`].
pub struct GpuQuery {
    source: Box<dyn TelemetrySource>,
    owners: Box<dyn OwnerLookup>,
    ids: GpuIdMap,
}

impl GpuQuery {
    /// Builds a query and captures the uuid to id map from an initial GPU
    /// snapshot. A failed initial snapshot leaves the map empty.
    pub fn new(source: Box<dyn TelemetrySource>, owners: Box<dyn OwnerLookup>) -> Self {
        let ids = capture_id_map(source.as_ref());
        Self::with_id_map(source, owners, ids)
    }

    pub fn with_id_map(
        source: Box<dyn TelemetrySource>,
        owners: Box<dyn OwnerLookup>,
        ids: GpuIdMap,
    ) -> Self {
        Self {
            source,
            owners,
            ids,
        }
    }

    pub fn nvidia_smi() -> Self {
        Self::new(Box::new(NvidiaSmi::new()), Box::new(PsOwnerLookup))
    }

    pub fn id_map(&self) -> &GpuIdMap {
        &self.ids
    }

    pub fn try_gpu_snapshot(&self) -> Result<Vec<GpuRecord>, SnapshotError> {
        fetch_gpus(self.source.as_ref())
    }

    /// GPU snapshot in device order; empty when the query fails for any reason.
    pub fn gpu_snapshot(&self) -> Vec<GpuRecord> {
        self.try_gpu_snapshot().unwrap_or_else(|err| {
            warn!(error = %err, "GPU snapshot failed");
            Vec::new()
        })
    }

    pub fn try_process_snapshot(&self) -> Result<Vec<GpuProcessRecord>, SnapshotError> {
        let stdout = self.source.query(QueryKind::ComputeApps)?;
        output_lines(&stdout)
            .enumerate()
            .map(|(idx, line)| -> Result<GpuProcessRecord, SnapshotError> {
                let mut record = parse::parse_process_line(line, &self.ids)
                    .map_err(|source| SnapshotError::Parse {
                        line: idx + 1,
                        source,
                    })?;
                match self.owners.owner(record.pid) {
                    Some((uid, name)) => {
                        record.owner_uid = Some(uid);
                        record.owner_name = name;
                    }
                    None => debug!(pid = record.pid, "process owner unresolved"),
                }
                Ok(record)
            })
            .collect()
    }

    pub fn process_snapshot(&self) -> Vec<GpuProcessRecord> {
        self.try_process_snapshot().unwrap_or_else(|err| {
            warn!(error = %err, "GPU process snapshot failed");
            Vec::new()
        })
    }
}

fn fetch_gpus(source: &dyn TelemetrySource) -> Result<Vec<GpuRecord>, SnapshotError> {
    let stdout = source.query(QueryKind::Gpus)?;
    output_lines(&stdout)
        .enumerate()
        .map(|(idx, line)| {
            parse::parse_gpu_line(line).map_err(|source| SnapshotError::Parse {
                line: idx + 1,
                source,
            })
        })
        .collect()
}

// Best effort: a failed snapshot leaves the map empty.
fn capture_id_map(source: &dyn TelemetrySource) -> GpuIdMap {
    match fetch_gpus(source) {
        Ok(gpus) => GpuIdMap::from_records(&gpus),
        Err(err) => {
            debug!(error = %err, "uuid map left empty");
            GpuIdMap::default()
        }
    }
}
