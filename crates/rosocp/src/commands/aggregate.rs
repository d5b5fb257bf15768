//! Offline aggregation of a usage report

use anyhow::{bail, Context, Result};
use rosocp_lib::report::{aggregate, CsvReport, METRIC_COLUMNS};
use std::path::Path;

const OUTPUT_FILE: &str = "output.csv";

const GROUP_COLUMNS: [&str; 8] = [
    "namespace",
    "k8s_object_type",
    "k8s_object_name",
    "workload",
    "container_name",
    "image_name",
    "interval_start",
    "interval_end",
];

pub fn run(input: &Path, output_dir: Option<&Path>) -> Result<()> {
    if !input.exists() {
        bail!("CSV file {} does not exist", input.display());
    }

    let bytes = std::fs::read(input).with_context(|| format!("Unable to read {}", input.display()))?;
    let report = CsvReport::parse(&bytes)?;
    let aggregation = aggregate(&report)?;

    let dir = match output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("Unable to create {}", dir.display()))?;
            dir.to_path_buf()
        }
        None => std::env::current_dir()?,
    };
    let output = dir.join(OUTPUT_FILE);

    let mut writer = csv::Writer::from_path(&output)?;
    writer.write_record(GROUP_COLUMNS.iter().copied().chain(METRIC_COLUMNS.iter().map(|c| c.name)))?;

    let mut rows = 0usize;
    for group in &aggregation.groups {
        for row in &group.rows {
            let mut record = vec![
                row.namespace.clone(),
                row.kind.as_str().to_string(),
                row.name.clone(),
                row.workload.clone(),
                row.container_name.clone(),
                row.image_name.clone(),
                row.interval_start.to_rfc3339(),
                row.interval_end.to_rfc3339(),
            ];
            record.extend(row.metrics.iter().map(|v| v.map(|v| v.to_string()).unwrap_or_default()));
            writer.write_record(&record)?;
            rows += 1;
        }
    }
    writer.flush()?;

    println!(
        "Aggregated CSV created at: {} ({rows} rows, {} invalid datapoints dropped)",
        output.display(),
        aggregation.invalid_datapoints
    );
    Ok(())
}
