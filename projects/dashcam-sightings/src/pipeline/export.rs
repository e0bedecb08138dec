// CSV export of merged report rows

use crate::pipeline::merge::{format_duration, format_time};
use crate::pipeline::types::ReportRow;
use crate::run_artifacts::write_atomic;
use anyhow::{anyhow, Context, Result};
use std::path::Path;

pub const REPORT_FILE_NAME: &str = "vehicle_detections.csv";

const HEADER: [&str; 7] = [
    "Time Start",
    "Time End",
    "Duration",
    "Make",
    "Model",
    "Color",
    "License Plate Number",
];

/// Render rows in the order given. The header is always present.
pub fn render_csv(rows: &[ReportRow]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(HEADER)?;
    for row in rows {
        writer.write_record([
            format_time(row.time_start).as_str(),
            format_time(row.time_end).as_str(),
            format_duration(row.duration()).as_str(),
            row.make(),
            row.model(),
            row.color(),
            row.plate_number(),
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to flush CSV writer: {}", e.error()))?;
    String::from_utf8(bytes).context("CSV output is not valid UTF-8")
}

/// Render and atomically replace `path`.
pub fn write_report(path: &Path, rows: &[ReportRow]) -> Result<()> {
    let csv = render_csv(rows)?;
    write_atomic(path, csv.as_bytes())
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    tracing::info!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}
