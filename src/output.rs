use crate::engine::VitalsReading;
use anyhow::{Context, Result};
use chrono::DateTime;
use std::io::Write;
use std::path::Path;

const HEADER: [&str; 9] = [
    "timestamp",
    "heart_rate",
    "spo2",
    "blood_pressure",
    "arrhythmia_status",
    "glucose",
    "cholesterol",
    "triglycerides",
    "calibration_progress",
];

/// Millisecond timestamps render as UTC datetimes; values too large for
/// chrono fall back to the raw number.
fn format_timestamp(timestamp_ms: u64) -> String {
    i64::try_from(timestamp_ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

pub fn write_readings<W: Write>(writer: W, readings: &[VitalsReading]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(HEADER)?;

    for reading in readings {
        writer.write_record(&[
            format_timestamp(reading.timestamp_ms),
            reading.heart_rate.to_string(),
            reading.spo2.to_string(),
            reading.blood_pressure.clone(),
            reading.arrhythmia_status.clone(),
            reading.glucose.to_string(),
            reading.lipids.cholesterol.to_string(),
            reading.lipids.triglycerides.to_string(),
            reading
                .calibration
                .map(|p| format!("{:.0}", p.overall()))
                .unwrap_or_default(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_readings_to_csv(path: &Path, readings: &[VitalsReading]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    println!("Writing results to {}", path.display());
    let file = std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    write_readings(file, readings)
}
