use crate::data::{GpuProcessRecord, GpuRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

// One column of a text table: header, alignment and how to render a cell.
pub struct Column<T> {
    pub header: &'static str,
    pub align: Align,
    pub value: fn(&T) -> String,
}

impl<T> Column<T> {
    pub fn left(header: &'static str, value: fn(&T) -> String) -> Self {
        Self {
            header,
            align: Align::Left,
            value,
        }
    }

    pub fn right(header: &'static str, value: fn(&T) -> String) -> Self {
        Self {
            header,
            align: Align::Right,
            value,
        }
    }
}

type GpuColumn = Column<GpuRecord>;
type ProcessColumn = Column<GpuProcessRecord>;

fn percent(fraction: f64) -> String {
    format!("{:.0}%", fraction * 100.0)
}

fn mib(value: f64) -> String {
    format!("{value:.0}MB")
}

fn clock(value: Option<u32>) -> String {
    value.map_or_else(|| "N/A".to_string(), |mhz| format!("{mhz}MHz"))
}

pub fn gpu_columns() -> Vec<Column<GpuRecord>> {
    vec![
        GpuColumn::right("ID", |g| g.id.to_string()),
        GpuColumn::right("GPU", |g| percent(g.load)),
        GpuColumn::right("MEM", |g| percent(g.memory_utilization)),
    ]
}

pub fn gpu_columns_all() -> Vec<Column<GpuRecord>> {
    vec![
        GpuColumn::right("ID", |g| g.id.to_string()),
        GpuColumn::left("Name", |g| g.name.clone()),
        GpuColumn::left("Serial", |g| g.serial.clone()),
        GpuColumn::left("UUID", |g| g.uuid.clone()),
        GpuColumn::right("GPU temp.", |g| format!("{:.0}C", g.temperature)),
        GpuColumn::right("GPU util.", |g| percent(g.load)),
        GpuColumn::right("Memory util.", |g| percent(g.memory_utilization)),
        GpuColumn::right("Memory total", |g| mib(g.total_memory)),
        GpuColumn::right("Memory used", |g| mib(g.used_memory)),
        GpuColumn::right("Memory free", |g| mib(g.free_memory)),
        GpuColumn::left("Display mode", |g| g.display_mode.clone()),
        GpuColumn::left("Display active", |g| g.display_active.clone()),
        GpuColumn::right("Core Clock", |g| clock(g.core_clock)),
        GpuColumn::right("Memory Clock", |g| clock(g.memory_clock)),
        GpuColumn::right("Power draw", |g| format!("{:.0}W", g.power_draw)),
        GpuColumn::left("Compute mode", |g| g.compute_mode.clone()),
        GpuColumn::right("PCI bus ID", |g| format!("{:X}", g.pci_bus)),
    ]
}

pub fn process_columns() -> Vec<Column<GpuProcessRecord>> {
    vec![
        ProcessColumn::right("PID", |p| p.pid.to_string()),
        ProcessColumn::left("Name", |p| p.process_name.clone()),
        ProcessColumn::right("GPU", |p| {
            p.gpu_id.map_or_else(|| "?".to_string(), |id| id.to_string())
        }),
        ProcessColumn::left("GPU UUID", |p| p.gpu_uuid.clone()),
        ProcessColumn::right("Memory used", |p| mib(p.used_memory)),
        ProcessColumn::left("User", |p| p.owner_name.clone()),
    ]
}

/// Renders `rows` as a `|`-separated table with a dashed rule under the header.
pub fn render<T>(rows: &[T], columns: &[Column<T>]) -> String {
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| columns.iter().map(|col| (col.value)(row)).collect())
        .collect();
    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            cells
                .iter()
                .map(|row| row[i].chars().count())
                .chain(std::iter::once(col.header.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: Vec<(&str, Align)>| -> String {
        let mut out = String::new();
        for ((value, align), width) in values.into_iter().zip(&widths) {
            match align {
                Align::Left => out.push_str(&format!("| {value:<width$} ")),
                Align::Right => out.push_str(&format!("| {value:>width$} ")),
            }
        }
        out.push('|');
        out
    };

    let header = line(columns.iter().map(|c| (c.header, Align::Left)).collect());
    let mut out = String::new();
    out.push_str(&header);
    out.push('\n');
    out.push_str(&"-".repeat(header.chars().count()));
    out.push('\n');
    for row in &cells {
        let values = row
            .iter()
            .zip(columns)
            .map(|(cell, col)| (cell.as_str(), col.align))
            .collect();
        out.push_str(&line(values));
        out.push('\n');
    }
    out
}

pub fn render_gpu_table(gpus: &[GpuRecord], all: bool) -> String {
    let columns = if all { gpu_columns_all() } else { gpu_columns() };
    render(gpus, &columns)
}

pub fn render_process_table(processes: &[GpuProcessRecord]) -> String {
    render(processes, &process_columns())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::gpu;

    #[test]
    fn short_table_layout() {
        let gpus = [gpu(0, 0.07, 4096.0, 16384.0), gpu(1, 1.0, 0.0, 16384.0)];
        let table = render_gpu_table(&gpus, false);
        let expected = "\
| ID | GPU  | MEM |
-------------------
|  0 |   7% | 25% |
|  1 | 100% |  0% |
";
        assert_eq!(table, expected);
    }

    #[test]
    fn nan_and_missing_values_render() {
        let mut g = gpu(3, f64::NAN, 0.0, 0.0);
        g.core_clock = None;
        let table = render_gpu_table(&[g], true);
        assert!(table.contains("NaN%"));
        assert!(table.contains("N/A"));
        assert!(table.contains(" A |"));
    }

    #[test]
    fn process_table_marks_unresolved_gpu() {
        let proc = GpuProcessRecord {
            pid: 31337,
            process_name: "python".to_string(),
            gpu_id: None,
            gpu_uuid: "GPU-ffff".to_string(),
            gpu_name: "Tesla T4".to_string(),
            used_memory: 812.0,
            owner_uid: Some(1000),
            owner_name: "alice".to_string(),
        };
        let table = render_process_table(&[proc]);
        let row = table.lines().nth(2).unwrap();
        assert_eq!(row, "| 31337 | python |   ? | GPU-ffff |       812MB | alice |");
    }

    #[test]
    fn empty_table_has_header_only() {
        assert_eq!(render_process_table(&[]).lines().count(), 2);
    }
}
