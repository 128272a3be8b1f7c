use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use log::{debug, warn};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// One raw PPG reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ms: u64,
    pub value: f64,
}

/// Accepts integer milliseconds or a `%Y-%m-%d %H:%M:%S%.f` datetime.
fn parse_timestamp(field: &str) -> Option<u64> {
    let field = field.trim();
    if let Ok(ms) = field.parse::<u64>() {
        return Some(ms);
    }
    if let Ok(ms) = field.parse::<f64>() {
        return (ms.is_finite() && ms >= 0.0).then(|| ms.round() as u64);
    }
    NaiveDateTime::parse_from_str(field, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .and_then(|dt| u64::try_from(dt.and_utc().timestamp_millis()).ok())
}

/// Reads `timestamp,value` rows. A header row is optional; rows with a
/// non-finite value are dropped and the result is sorted by timestamp.
pub fn read_samples<R: Read>(reader: R) -> Result<Vec<Sample>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut samples = Vec::new();
    let mut dropped = 0usize;

    for (line, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read CSV row {}", line + 1))?;
        let (Some(ts_field), Some(value_field)) = (record.get(0), record.get(1)) else {
            anyhow::bail!("Row {} needs timestamp and value columns", line + 1);
        };

        let Some(timestamp_ms) = parse_timestamp(ts_field) else {
            if line == 0 {
                debug!("Skipping header row: {:?}", record);
                continue;
            }
            anyhow::bail!("Row {}: invalid timestamp {:?}", line + 1, ts_field);
        };
        let value: f64 = value_field
            .parse()
            .with_context(|| format!("Row {}: invalid value {:?}", line + 1, value_field))?;
        if !value.is_finite() {
            dropped += 1;
            continue;
        }
        samples.push(Sample { timestamp_ms, value });
    }

    if dropped > 0 {
        warn!("Dropped {} rows with non-finite values", dropped);
    }
    samples.sort_by_key(|s| s.timestamp_ms);
    Ok(samples)
}

pub fn load_samples(path: &Path) -> Result<Vec<Sample>> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    let samples = read_samples(file).with_context(|| format!("Failed to parse {}", path.display()))?;
    debug!("Loaded {} samples from {}", samples.len(), path.display());
    Ok(samples)
}
