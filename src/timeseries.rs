//! Append-only CSV logs for features and labels.
//!
//! Each file is a time series keyed by `(line, timestamp)`. Rows are only
//! ever appended; readers filter by line and time themselves.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing::debug;

use crate::lag::DelayObservation;
use crate::model::{LaggedFeatureRow, LineName};

fn open_for_append(path: &Path) -> Result<(fs::File, bool)> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let has_content = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    Ok((file, has_content))
}

/// Appends `records` as rows of the CSV file at `path`.
///
/// Creates the file with headers if it does not already exist.
pub fn append_records<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let (file, has_content) = open_for_append(path)?;
    debug!(path = %path.display(), rows = records.len(), has_content, "Appending CSV records");

    let mut writer = WriterBuilder::new()
        .has_headers(!has_content)
        .from_writer(file);
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(())
}

/// Reads every row of a log; a missing file is an empty log.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = ReaderBuilder::new()
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("reading {}", path.display()))
}

fn lagged_header(offsets: &[u32]) -> Vec<String> {
    let mut header: Vec<String> = ["timestamp", "line", "delay_current"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend(offsets.iter().map(|o| format!("delay_{o}")));
    header
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Appends lagged rows under a `timestamp,line,delay_current,delay_<offset>…`
/// header. An existing file must carry the same offsets.
pub fn append_lagged_rows(path: &Path, rows: &[LaggedFeatureRow], offsets: &[u32]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let header = lagged_header(offsets);

    if path.exists() {
        let mut reader = ReaderBuilder::new().from_path(path)?;
        let existing = reader.headers()?;
        if !existing.is_empty() && existing.iter().ne(header.iter().map(String::as_str)) {
            bail!(
                "{} has columns {:?}, expected {:?}",
                path.display(),
                existing,
                header
            );
        }
    }

    let (file, has_content) = open_for_append(path)?;
    let mut writer = WriterBuilder::new().from_writer(file);
    if !has_content {
        writer.write_record(&header)?;
    }
    for row in rows {
        if row.lags.iter().map(|(o, _)| *o).ne(offsets.iter().copied()) {
            bail!("row for {} does not match configured offsets", row.line);
        }
        let mut record = vec![
            row.timestamp.to_rfc3339(),
            row.line.to_string(),
            fmt_opt(row.delay_current),
        ];
        record.extend(row.lags.iter().map(|(_, v)| fmt_opt(*v)));
        writer.write_record(&record)?;
    }
    writer.flush()?;

    Ok(())
}

/// Reads the `delay_current` series out of a lagged feature log.
pub fn read_delay_history(path: &Path) -> Result<Vec<DelayObservation>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = ReaderBuilder::new()
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .with_context(|| format!("{} has no '{name}' column", path.display()))
    };
    let (ts_idx, line_idx, delay_idx) = (
        column("timestamp")?,
        column("line")?,
        column("delay_current")?,
    );

    let mut history = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or_default();

        let timestamp = DateTime::parse_from_rfc3339(field(ts_idx))
            .with_context(|| format!("bad timestamp '{}'", field(ts_idx)))?
            .with_timezone(&Utc);
        let line: LineName = field(line_idx).parse().map_err(anyhow::Error::msg)?;
        let delay_current = match field(delay_idx) {
            "" => None,
            v => Some(v.parse::<f64>().with_context(|| format!("bad delay '{v}'"))?),
        };

        history.push(DelayObservation {
            timestamp,
            line,
            delay_current,
        });
    }

    Ok(history)
}
