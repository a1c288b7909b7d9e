//! Folding per-capture feed messages into one file per feed and local hour.
//!
//! The hourly file doubles as the completion marker for its hour: once it
//! exists the hour is never read or written again.

use crate::layout::{DataLayout, HourKey, parse_date_dir};
use crate::model::{FeedKind, HourlyAggregate, Snapshot, TripFilter};
use crate::normalize::{normalize_bytes, parse_feed};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateOutcome {
    Written {
        path: PathBuf,
        snapshots: usize,
        skipped_captures: usize,
    },
    /// The hourly file already exists; nothing was read or written.
    AlreadyAggregated,
    /// No capture directory for the hour.
    NoCaptures,
}

/// Where [`store_capture`] put a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCapture {
    pub path: PathBuf,
    /// The hour was already aggregated, so this capture will never be read.
    pub late: bool,
}

/// Stores one raw capture below the hour its feed header points at, falling
/// back to `fetched_at` when the bytes do not decode.
pub fn store_capture(
    layout: &DataLayout,
    feed: FeedKind,
    bytes: &[u8],
    fetched_at: DateTime<Utc>,
    tz: Tz,
) -> Result<StoredCapture> {
    let timestamp = parse_feed(bytes)
        .ok()
        .and_then(|f| f.header.timestamp)
        .unwrap_or_else(|| fetched_at.timestamp().max(0) as u64);
    let key = HourKey::containing(timestamp, feed, tz)
        .with_context(|| format!("capture timestamp {timestamp} out of range"))?;

    let path = layout.capture_path(&key, timestamp);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    debug!(path = %path.display(), bytes = bytes.len(), "Capture stored");

    let late = layout.hourly_path(&key).exists();
    if late {
        warn!(
            path = %path.display(),
            date = %key.date,
            hour = key.hour,
            "Capture belongs to an hour that is already aggregated and will not be read"
        );
    }

    Ok(StoredCapture { path, late })
}

/// Capture files of a raw hour directory in lexical order.
fn list_captures(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut captures = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("pb") {
            captures.push(path);
        }
    }
    captures.sort();
    Ok(captures)
}

/// Orders snapshots by timestamp (stable) and keeps the first of each run of
/// equal timestamps.
pub fn order_snapshots(mut snapshots: Vec<Snapshot>) -> Vec<Snapshot> {
    snapshots.sort_by_key(|s| s.timestamp);
    snapshots.dedup_by_key(|s| s.timestamp);
    snapshots
}

/// Builds the hourly aggregate for `key` from its raw captures.
///
/// Undecodable captures are skipped with a warning. The file is only
/// written after every capture of the directory has been consumed, and it is
/// renamed into place so a half-written hour is never visible.
#[tracing::instrument(skip(layout, trips, tz), fields(date = %key.date, hour = key.hour, feed = %key.feed))]
pub fn aggregate_hour<F: TripFilter + ?Sized>(
    layout: &DataLayout,
    key: HourKey,
    trips: &F,
    tz: Tz,
) -> Result<AggregateOutcome> {
    let out = layout.hourly_path(&key);
    if out.exists() {
        info!(path = %out.display(), "Hour already aggregated");
        return Ok(AggregateOutcome::AlreadyAggregated);
    }

    let raw = layout.raw_dir(&key);
    if !raw.is_dir() {
        debug!(dir = %raw.display(), "No captures for hour");
        return Ok(AggregateOutcome::NoCaptures);
    }

    let captures = list_captures(&raw)?;
    let mut snapshots = Vec::with_capacity(captures.len());
    let mut skipped_captures = 0;

    for path in &captures {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        match normalize_bytes(&bytes, trips) {
            Ok(Some(snapshot)) if key.contains(snapshot.timestamp, tz) => snapshots.push(snapshot),
            Ok(Some(snapshot)) => {
                warn!(
                    path = %path.display(),
                    timestamp = snapshot.timestamp,
                    "Capture timestamp outside hour, dropped"
                );
                skipped_captures += 1;
            }
            Ok(None) => debug!(path = %path.display(), "No relevant entities in capture"),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable capture");
                skipped_captures += 1;
            }
        }
    }

    let aggregate = HourlyAggregate {
        date: key.date,
        hour: key.hour,
        snapshots: order_snapshots(snapshots),
    };
    write_aggregate(&out, &aggregate)?;

    info!(
        captures = captures.len(),
        snapshots = aggregate.snapshots.len(),
        skipped_captures,
        "Hourly aggregate written"
    );

    Ok(AggregateOutcome::Written {
        path: out,
        snapshots: aggregate.snapshots.len(),
        skipped_captures,
    })
}

fn write_aggregate(path: &Path, aggregate: &HourlyAggregate) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(aggregate)?)
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

pub fn read_aggregate(path: &Path) -> Result<HourlyAggregate> {
    let content = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Hours of `feed` that have captures but no aggregate yet, oldest first.
/// The hour containing `now` is still being captured and is left out.
pub fn pending_hours(
    layout: &DataLayout,
    feed: FeedKind,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Vec<HourKey>> {
    let root = layout.realtime_dir();
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let current = HourKey::containing(now.timestamp().max(0) as u64, feed, tz);

    let mut pending = Vec::new();
    for entry in fs::read_dir(&root).with_context(|| format!("listing {}", root.display()))? {
        let entry = entry?;
        let Some(date) = entry.file_name().to_str().and_then(parse_date_dir) else {
            continue;
        };
        let raw_root = layout.feed_dir(date, feed).join("raw");
        if !raw_root.is_dir() {
            continue;
        }
        for hour_entry in fs::read_dir(&raw_root)? {
            let hour_entry = hour_entry?;
            let Some(hour) = hour_entry
                .file_name()
                .to_str()
                .and_then(|h| h.parse::<u32>().ok())
                .filter(|h| *h < 24)
            else {
                continue;
            };
            let key = HourKey::new(date, hour, feed);
            if current.is_some_and(|c| key >= c) {
                continue;
            }
            if !layout.hourly_path(&key).exists() {
                pending.push(key);
            }
        }
    }

    pending.sort();
    Ok(pending)
}
