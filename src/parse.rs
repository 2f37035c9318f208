//! Line parsers for `nvidia-smi --format=csv,noheader,nounits` output.
//!
//! Fields are positional and separated by `", "`. Float fields are parsed
//! permissively (see [`parse_or_nan`]); identity fields are strict, and a line
//! with the wrong number of fields is rejected outright.

use crate::data::{GpuIdMap, GpuProcessRecord, GpuRecord};
use thiserror::Error;

pub const FIELD_SEPARATOR: &str = ", ";

/// Fields requested with `--query-gpu`, in the order [`parse_gpu_line`] reads them.
pub const GPU_QUERY_FIELDS: [&str; 19] = [
    "index",
    "uuid",
    "utilization.gpu",
    "memory.total",
    "memory.used",
    "memory.free",
    "driver_version",
    "name",
    "gpu_serial",
    "display_active",
    "display_mode",
    "temperature.gpu",
    "clocks.current.graphics",
    "clocks.current.memory",
    "vbios_version",
    "power.draw",
    "power.limit",
    "compute_mode",
    "pci.bus",
];

/// Fields requested with `--query-compute-apps`.
pub const PROCESS_QUERY_FIELDS: [&str; 5] =
    ["pid", "process_name", "gpu_uuid", "gpu_name", "used_memory"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("field '{field}' is not a valid integer: {value:?}")]
    InvalidInteger { field: &'static str, value: String },
}

/// Parses a float, mapping anything unparsable (`[N/A]`, `[Not Supported]`, ...) to NaN.
pub fn parse_or_nan(value: &str) -> f64 {
    value.trim().parse::<f64>().unwrap_or(f64::NAN)
}

fn parse_or_none(value: &str) -> Option<u32> {
    value.trim().parse::<u32>().ok()
}

fn parse_int(field: &'static str, value: &str) -> Result<u32, ParseError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ParseError::InvalidInteger {
            field,
            value: value.to_string(),
        })
}

fn parse_hex(field: &'static str, value: &str) -> Result<u32, ParseError> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16).map_err(|_| ParseError::InvalidInteger {
        field,
        value: value.to_string(),
    })
}

fn split_fields<const N: usize>(line: &str) -> Result<[&str; N], ParseError> {
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    let found = fields.len();
    fields
        .try_into()
        .map_err(|_| ParseError::FieldCount { expected: N, found })
}

pub fn parse_gpu_line(line: &str) -> Result<GpuRecord, ParseError> {
    let [
        index,
        uuid,
        utilization,
        total,
        used,
        free,
        driver,
        name,
        serial,
        display_active,
        display_mode,
        temperature,
        core_clock,
        memory_clock,
        vbios,
        power_draw,
        power_limit,
        compute_mode,
        pci_bus,
    ] = split_fields::<19>(line)?;

    let total_memory = parse_or_nan(total);
    let used_memory = parse_or_nan(used);

    Ok(GpuRecord {
        id: parse_int("index", index)?,
        uuid: uuid.to_string(),
        load: parse_or_nan(utilization) / 100.0,
        memory_utilization: GpuRecord::memory_utilization(used_memory, total_memory),
        total_memory,
        used_memory,
        free_memory: parse_or_nan(free),
        driver_version: driver.to_string(),
        name: name.to_string(),
        serial: serial.to_string(),
        display_mode: display_mode.to_string(),
        display_active: display_active.to_string(),
        temperature: parse_or_nan(temperature),
        vbios_version: vbios.to_string(),
        power_draw: parse_or_nan(power_draw),
        power_limit: parse_or_nan(power_limit),
        core_clock: parse_or_none(core_clock),
        memory_clock: parse_or_none(memory_clock),
        compute_mode: compute_mode.to_string(),
        pci_bus: parse_hex("pci.bus", pci_bus)?,
    })
}

/// Parses one compute-app line. The owner fields are left unresolved; the
/// fetcher fills them in from the process table.
pub fn parse_process_line(line: &str, ids: &GpuIdMap) -> Result<GpuProcessRecord, ParseError> {
    let [pid, process_name, gpu_uuid, gpu_name, used_memory] = split_fields::<5>(line)?;

    Ok(GpuProcessRecord {
        pid: parse_int("pid", pid)?,
        process_name: process_name.to_string(),
        gpu_id: ids.resolve(gpu_uuid),
        gpu_uuid: gpu_uuid.to_string(),
        gpu_name: gpu_name.to_string(),
        used_memory: parse_or_nan(used_memory),
        owner_uid: None,
        owner_name: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const A100: &str = "0, GPU-5c3b6a41-8b7e-2f1d-9a0c-44e1f2d3b6c7, 37, 40960, 10240, 30720, \
        535.104.05, NVIDIA A100-SXM4-40GB, 1321020012345, Disabled, Enabled, 41, 1410, 1215, \
        92.00.36.00.01, 187.25, 400.00, Default, 0x07";

    #[test]
    fn parses_well_formed_gpu_line() {
        let gpu = parse_gpu_line(A100).unwrap();
        assert_eq!(gpu.id, 0);
        assert_eq!(gpu.uuid, "GPU-5c3b6a41-8b7e-2f1d-9a0c-44e1f2d3b6c7");
        assert_eq!(gpu.load, 0.37);
        assert_eq!(gpu.total_memory, 40960.0);
        assert_eq!(gpu.used_memory, 10240.0);
        assert_eq!(gpu.free_memory, 30720.0);
        assert_eq!(gpu.memory_utilization, gpu.used_memory / gpu.total_memory);
        assert_eq!(gpu.display_active, "Disabled");
        assert_eq!(gpu.display_mode, "Enabled");
        assert_eq!(gpu.temperature, 41.0);
        assert_eq!(gpu.core_clock, Some(1410));
        assert_eq!(gpu.memory_clock, Some(1215));
        assert_eq!(gpu.power_draw, 187.25);
        assert_eq!(gpu.compute_mode, "Default");
        assert_eq!(gpu.pci_bus, 7);
    }

    #[test]
    fn unparsable_floats_become_nan() {
        let line = A100
            .replace(", 37, ", ", [N/A], ")
            .replace("187.25", "[Not Supported]");
        let gpu = parse_gpu_line(&line).unwrap();
        assert!(gpu.load.is_nan());
        assert!(gpu.power_draw.is_nan());
        assert_eq!(gpu.power_limit, 400.0);
    }

    #[test]
    fn unreported_clocks_are_none() {
        let line = A100.replace("1410, 1215", "[N/A], [N/A]");
        let gpu = parse_gpu_line(&line).unwrap();
        assert_eq!(gpu.core_clock, None);
        assert_eq!(gpu.memory_clock, None);
    }

    #[test]
    fn pci_bus_is_hexadecimal() {
        let gpu = parse_gpu_line(&A100.replace("0x07", "0x3B")).unwrap();
        assert_eq!(gpu.pci_bus, 0x3b);
        let gpu = parse_gpu_line(&A100.replace("0x07", "81")).unwrap();
        assert_eq!(gpu.pci_bus, 0x81);
    }

    #[test]
    fn zero_total_memory_gives_nan_utilization() {
        let line = A100.replace("40960, 10240, 30720", "0, 0, 0");
        assert!(parse_gpu_line(&line).unwrap().memory_utilization.is_nan());
    }

    #[test]
    fn short_line_is_rejected() {
        assert_eq!(
            parse_gpu_line("0, GPU-1, 12"),
            Err(ParseError::FieldCount {
                expected: 19,
                found: 3
            })
        );
    }

    #[test]
    fn bad_index_is_rejected() {
        let err = parse_gpu_line(&A100.replacen("0, ", "x, ", 1)).unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidInteger {
                field: "index",
                value: "x".to_string()
            }
        );
    }

    #[test]
    fn process_line_resolves_gpu_id() {
        let ids: GpuIdMap = [("GPU-aaaa".to_string(), 2)].into_iter().collect();
        let proc = parse_process_line("4242, python3, GPU-aaaa, Tesla T4, 1337", &ids).unwrap();
        assert_eq!(proc.pid, 4242);
        assert_eq!(proc.process_name, "python3");
        assert_eq!(proc.gpu_id, Some(2));
        assert_eq!(proc.gpu_name, "Tesla T4");
        assert_eq!(proc.used_memory, 1337.0);
        assert_eq!(proc.owner_uid, None);
        assert!(proc.owner_name.is_empty());

        let orphan = parse_process_line("7, a.out, GPU-bbbb, Tesla T4, [N/A]", &ids).unwrap();
        assert_eq!(orphan.gpu_id, None);
        assert!(orphan.used_memory.is_nan());
    }

    #[test]
    fn process_line_needs_five_fields() {
        let err = parse_process_line("4242, python3", &GpuIdMap::default()).unwrap_err();
        assert_eq!(
            err,
            ParseError::FieldCount {
                expected: 5,
                found: 2
            }
        );
    }

    proptest! {
        #[test]
        fn any_utilization_text_parses(text in "[A-Za-z0-9\\[\\]/. _-]{0,16}") {
            let line = A100.replace(", 37, ", &format!(", {text}, "));
            let gpu = parse_gpu_line(&line);
            prop_assert!(gpu.is_ok());
        }

        #[test]
        fn memory_utilization_matches_ratio(used in 0u32..100_000, total in 1u32..100_000) {
            let line = A100.replace(
                "40960, 10240, 30720",
                &format!("{total}, {used}, {}", total.saturating_sub(used)),
            );
            let gpu = parse_gpu_line(&line).unwrap();
            prop_assert_eq!(gpu.memory_utilization, used as f64 / total as f64);
        }
    }
}
