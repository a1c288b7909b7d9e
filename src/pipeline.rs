//! The scheduled jobs: schedule resolution, capture, hourly aggregation,
//! feature extraction and the live delay ingest.
//!
//! Every job runs sequentially and takes `now` from the caller so one
//! invocation sees a single clock reading.

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, DurationRound, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::aggregate::{
    AggregateOutcome, aggregate_hour, pending_hours, read_aggregate, store_capture,
};
use crate::config::{PipelineConfig, REALTIME_API_KEY, STATIC_API_KEY, api_key};
use crate::extract::{extract_delays, extract_features, extract_live_delays};
use crate::fetch::auth::UrlParam;
use crate::fetch::{BasicClient, HttpClient, Sleeper, fetch_with_retry};
use crate::lag::{DelayObservation, lagged_row};
use crate::layout::{DataLayout, HourKey, parse_date_dir};
use crate::model::{DelayRecord, FeedKind, LaggedFeatureRow, LineName, Snapshot, TripLineMap};
use crate::normalize::normalize_bytes;
use crate::resolver::resolve;
use crate::schedule::{StaticTables, filter_and_save};
use crate::timeseries::{append_lagged_rows, append_records, read_delay_history};

#[derive(Debug, Serialize, Deserialize)]
struct TripLineRow {
    trip_id: String,
    line: LineName,
    service_date: NaiveDate,
}

/// Writes the mapping as `trip_id,line,service_date`, replacing any
/// previous day's file.
pub fn save_trip_line_map(path: &Path, map: &TripLineMap, service_date: NaiveDate) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let tmp = path.with_extension("csv.tmp");
    let mut writer = csv::Writer::from_path(&tmp)
        .with_context(|| format!("creating {}", tmp.display()))?;
    for (trip_id, line) in map.sorted_entries() {
        writer.serialize(TripLineRow {
            trip_id: trip_id.to_string(),
            line,
            service_date,
        })?;
    }
    writer.flush()?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// The persisted mapping, if it was built for `today`. A missing, empty or
/// stale file gives `None` and the schedule has to be resolved again.
pub fn load_trip_line_map(path: &Path, today: NaiveDate) -> Result<Option<TripLineMap>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let rows = reader
        .deserialize()
        .collect::<Result<Vec<TripLineRow>, _>>()
        .with_context(|| format!("reading {}", path.display()))?;

    let Some(first) = rows.first() else {
        return Ok(None);
    };
    if rows.iter().any(|r| r.service_date != today) {
        info!(service_date = %first.service_date, today = %today, "Trip line map is stale");
        return Ok(None);
    }

    Ok(Some(rows.into_iter().map(|r| (r.trip_id, r.line)).collect()))
}

/// Resolves the relevant ids from an extracted schedule in `static_dir`,
/// writes the filtered tables for `today` and persists the trip-to-line map.
#[tracing::instrument(skip(config), fields(static_dir = %static_dir.display(), today = %today))]
pub fn resolve_static(
    config: &PipelineConfig,
    static_dir: &Path,
    today: NaiveDate,
) -> Result<TripLineMap> {
    let layout = config.layout();
    let tables = StaticTables::load(static_dir)?;
    let resolution = resolve(&tables, &config.lines)?;

    filter_and_save(static_dir, &layout.filtered_dir(today), &resolution.ids)?;
    save_trip_line_map(&layout.trip_line_map(), &resolution.trip_lines, today)?;

    info!(
        trips = resolution.trip_lines.len(),
        lines = ?resolution.trip_lines.lines(),
        "Trip line map saved"
    );
    Ok(resolution.trip_lines)
}

/// Today's mapping: the persisted one when still valid, otherwise freshly
/// resolved from `static_dir` (default: today's static directory).
pub fn trip_lines_for(
    config: &PipelineConfig,
    static_dir: Option<&Path>,
    today: NaiveDate,
) -> Result<TripLineMap> {
    let layout = config.layout();
    if let Some(map) = load_trip_line_map(&layout.trip_line_map(), today)? {
        return Ok(map);
    }
    let dir = static_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| layout.static_dir(today));
    resolve_static(config, &dir, today)
}

/// A client that adds the API key stored in `var` to every request.
pub fn keyed_client(config: &PipelineConfig, var: &str) -> Result<UrlParam<BasicClient>> {
    let key = api_key(var)?;
    let inner = BasicClient::new(config.fetch.timeout()).context("building HTTP client")?;
    Ok(UrlParam::new(inner, key))
}

pub fn realtime_client(config: &PipelineConfig) -> Result<UrlParam<BasicClient>> {
    keyed_client(config, REALTIME_API_KEY)
}

/// Downloads the static archive for `today` as-is. `None` when the provider
/// never delivered it.
#[tracing::instrument(skip_all, fields(today = %today))]
pub async fn download_static<S: Sleeper + ?Sized>(
    config: &PipelineConfig,
    sleeper: &S,
    today: NaiveDate,
) -> Result<Option<PathBuf>> {
    let client = keyed_client(config, STATIC_API_KEY)?;
    let policy = config.fetch.retry_policy();
    let Some(bytes) = fetch_with_retry(&client, &config.static_url, &policy, sleeper).await else {
        warn!("Static archive unavailable, skipped");
        return Ok(None);
    };

    let path = config.layout().static_archive(today);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    fs::write(&path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), bytes = bytes.len(), "Static archive saved");
    Ok(Some(path))
}

/// Fetches one realtime feed under the configured retry policy.
pub async fn fetch_feed<C, S>(
    config: &PipelineConfig,
    client: &C,
    sleeper: &S,
    feed: FeedKind,
) -> Option<Bytes>
where
    C: HttpClient + ?Sized,
    S: Sleeper + ?Sized,
{
    let policy = config.fetch.retry_policy();
    fetch_with_retry(client, &config.feed_url(feed), &policy, sleeper).await
}

/// Fetches and stores one capture of each feed. Returns the trip updates
/// payload when it arrived so the live ingest can reuse it.
#[tracing::instrument(skip_all, fields(fetched_at = %fetched_at))]
pub async fn capture<C, S>(
    config: &PipelineConfig,
    client: &C,
    sleeper: &S,
    fetched_at: DateTime<Utc>,
) -> Result<Option<Bytes>>
where
    C: HttpClient + ?Sized,
    S: Sleeper + ?Sized,
{
    let layout = config.layout();
    let mut trip_updates = None;

    for feed in [FeedKind::VehiclePositions, FeedKind::TripUpdates] {
        let Some(bytes) = fetch_feed(config, client, sleeper, feed).await else {
            warn!(feed = %feed, "Feed unavailable, capture skipped");
            continue;
        };
        let stored = store_capture(&layout, feed, &bytes, fetched_at, config.timezone)?;
        info!(feed = %feed, path = %stored.path.display(), late = stored.late, "Capture stored");
        if feed == FeedKind::TripUpdates {
            trip_updates = Some(bytes);
        }
    }

    Ok(trip_updates)
}

/// Aggregates every finished hour that has captures but no hourly file.
#[tracing::instrument(skip_all, fields(now = %now))]
pub fn aggregate_pending(
    config: &PipelineConfig,
    trip_lines: &TripLineMap,
    now: DateTime<Utc>,
) -> Result<Vec<(HourKey, AggregateOutcome)>> {
    let layout = config.layout();
    let mut outcomes = Vec::new();

    for feed in [FeedKind::VehiclePositions, FeedKind::TripUpdates] {
        for key in pending_hours(&layout, feed, now, config.timezone)? {
            let outcome = aggregate_hour(&layout, key, trip_lines, config.timezone)?;
            outcomes.push((key, outcome));
        }
    }

    Ok(outcomes)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HourExtraction {
    pub feature_rows: usize,
    pub label_rows: usize,
}

/// Appends the vehicle features and delay labels of one local hour, read
/// from whichever of its hourly aggregates exist, then marks the hour as
/// extracted. An hour already marked is left alone.
#[tracing::instrument(skip(config, trip_lines))]
pub fn extract_hour(
    config: &PipelineConfig,
    trip_lines: &TripLineMap,
    date: NaiveDate,
    hour: u32,
) -> Result<HourExtraction> {
    let layout = config.layout();
    let marker = layout.extracted_marker(date, hour);
    if marker.exists() {
        info!("Hour already extracted");
        return Ok(HourExtraction::default());
    }

    let vp = HourKey::new(date, hour, FeedKind::VehiclePositions);
    let tu = HourKey::new(date, hour, FeedKind::TripUpdates);
    let timestamp = vp
        .start(config.timezone)
        .with_context(|| format!("{date} {hour:02}:00 does not exist in {}", config.timezone))?;

    let vp_path = layout.hourly_path(&vp);
    let features = if vp_path.exists() {
        let aggregate = read_aggregate(&vp_path)?;
        extract_features(
            &aggregate.snapshots,
            trip_lines,
            timestamp,
            config.stopped_speed_threshold,
        )
    } else {
        Vec::new()
    };

    let tu_path = layout.hourly_path(&tu);
    let labels = if tu_path.exists() {
        let aggregate = read_aggregate(&tu_path)?;
        extract_delays(&aggregate.snapshots, trip_lines, &config.lines_vec(), timestamp)
    } else {
        Vec::new()
    };

    append_records(&layout.vehicle_features(), &features)?;
    append_records(&layout.hourly_delay_labels(), &labels)?;

    if let Some(dir) = marker.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    fs::write(&marker, b"").with_context(|| format!("writing {}", marker.display()))?;

    let extraction = HourExtraction {
        feature_rows: features.len(),
        label_rows: labels.len(),
    };
    info!(
        feature_rows = extraction.feature_rows,
        label_rows = extraction.label_rows,
        "Hour extracted"
    );
    Ok(extraction)
}

/// Local hours with at least one hourly aggregate and no extraction marker,
/// oldest first.
pub fn unextracted_hours(layout: &DataLayout) -> Result<Vec<(NaiveDate, u32)>> {
    let root = layout.realtime_dir();
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut hours = BTreeSet::new();
    for entry in fs::read_dir(&root).with_context(|| format!("listing {}", root.display()))? {
        let Some(date) = entry?.file_name().to_str().and_then(parse_date_dir) else {
            continue;
        };
        for feed in [FeedKind::VehiclePositions, FeedKind::TripUpdates] {
            let dir = layout.hourly_dir(date, feed);
            if !dir.is_dir() {
                continue;
            }
            for file in fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))? {
                let path = file?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(hour) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u32>().ok())
                    .filter(|h| *h < 24)
                else {
                    continue;
                };
                if !layout.extracted_marker(date, hour).exists() {
                    hours.insert((date, hour));
                }
            }
        }
    }

    Ok(hours.into_iter().collect())
}

/// Extracts every aggregated hour not yet extracted. An hour whose
/// extraction failed stays unmarked and is picked up by the next call.
#[tracing::instrument(skip_all)]
pub fn extract_pending(
    config: &PipelineConfig,
    trip_lines: &TripLineMap,
) -> Result<Vec<(NaiveDate, u32)>> {
    let hours = unextracted_hours(&config.layout())?;
    for (date, hour) in &hours {
        extract_hour(config, trip_lines, *date, *hour)?;
    }
    Ok(hours)
}

/// Delay labels for every configured line and lagged rows for the lines
/// whose current delay is defined.
pub fn live_rows(
    snapshot: Option<&Snapshot>,
    trip_lines: &TripLineMap,
    lines: &[LineName],
    history: &[DelayObservation],
    timestamp: DateTime<Utc>,
    offsets: &[u32],
) -> (Vec<DelayRecord>, Vec<LaggedFeatureRow>) {
    let labels = extract_live_delays(snapshot, trip_lines, lines, timestamp);
    let rows = labels
        .iter()
        .filter(|l| l.avg_delay.is_some())
        .map(|l| lagged_row(history, l.line, timestamp, l.avg_delay, offsets))
        .collect();
    (labels, rows)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LiveIngest {
    pub label_rows: usize,
    pub lagged_rows: usize,
}

/// Turns one trip updates payload into the live delay label and lagged
/// features, stamped with `now` floored to the minute.
#[tracing::instrument(skip_all, fields(now = %now))]
pub fn ingest_trip_updates(
    config: &PipelineConfig,
    trip_lines: &TripLineMap,
    bytes: &[u8],
    now: DateTime<Utc>,
) -> Result<Option<LiveIngest>> {
    let snapshot = match normalize_bytes(bytes, trip_lines) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Unreadable trip updates, live ingest skipped");
            return Ok(None);
        }
    };
    let timestamp = now.duration_trunc(TimeDelta::minutes(1))?;

    let layout = config.layout();
    let history = read_delay_history(&layout.delay_features())?;
    let (labels, rows) = live_rows(
        snapshot.as_ref(),
        trip_lines,
        &config.lines_vec(),
        &history,
        timestamp,
        &config.lag_offsets_minutes,
    );

    append_lagged_rows(&layout.delay_features(), &rows, &config.lag_offsets_minutes)?;
    append_records(&layout.delay_labels(), &labels)?;

    info!(label_rows = labels.len(), lagged_rows = rows.len(), "Live delays ingested");
    Ok(Some(LiveIngest {
        label_rows: labels.len(),
        lagged_rows: rows.len(),
    }))
}

/// Fetches the trip updates feed and ingests it. `None` when the feed could
/// not be fetched or decoded this period.
pub async fn ingest_live<C, S>(
    config: &PipelineConfig,
    client: &C,
    sleeper: &S,
    trip_lines: &TripLineMap,
    now: DateTime<Utc>,
) -> Result<Option<LiveIngest>>
where
    C: HttpClient + ?Sized,
    S: Sleeper + ?Sized,
{
    let Some(bytes) = fetch_feed(config, client, sleeper, FeedKind::TripUpdates).await else {
        warn!("Trip updates unavailable, live ingest skipped");
        return Ok(None);
    };
    ingest_trip_updates(config, trip_lines, &bytes, now)
}

/// One full scheduled invocation: capture both feeds, aggregate and extract
/// every finished hour, then ingest the live delay from the fresh capture.
#[tracing::instrument(skip_all, fields(now = %now))]
pub async fn run<C, S>(
    config: &PipelineConfig,
    client: &C,
    sleeper: &S,
    trip_lines: &TripLineMap,
    now: DateTime<Utc>,
) -> Result<()>
where
    C: HttpClient + ?Sized,
    S: Sleeper + ?Sized,
{
    let trip_updates = capture(config, client, sleeper, now).await?;

    let aggregated = aggregate_pending(config, trip_lines, now)?;
    info!(hours = aggregated.len(), "Pending hours aggregated");
    let extracted = extract_pending(config, trip_lines)?;

    match trip_updates {
        Some(bytes) => {
            ingest_trip_updates(config, trip_lines, &bytes, now)?;
        }
        None => warn!("No trip updates this period, live ingest skipped"),
    }

    info!(hours_extracted = extracted.len(), "Run complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RealtimeEntity, StopTimeUpdate};
    use std::env;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 12).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn map() -> TripLineMap {
        [
            ("T1".to_string(), LineName::Green),
            ("T2".to_string(), LineName::Red),
        ]
        .into_iter()
        .collect()
    }

    fn delayed(trip_id: &str, delay: i32) -> RealtimeEntity {
        RealtimeEntity {
            id: trip_id.to_string(),
            trip_id: trip_id.to_string(),
            vehicle: None,
            stop_time_update: vec![StopTimeUpdate {
                stop_sequence: 3,
                arrival_delay: Some(delay),
                departure_delay: None,
            }],
        }
    }

    #[test]
    fn test_trip_line_map_is_valid_for_one_day() {
        let path = env::temp_dir().join("metro_delay_pipeline_tlm/trip_line_map.csv");
        let _ = fs::remove_file(&path);

        assert!(load_trip_line_map(&path, today()).unwrap().is_none());

        save_trip_line_map(&path, &map(), today()).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "trip_id,line,service_date\nT1,green,2025-12-12\nT2,red,2025-12-12\n"
        );

        let loaded = load_trip_line_map(&path, today()).unwrap().unwrap();
        assert_eq!(loaded.line_of("T2"), Some(LineName::Red));
        assert_eq!(loaded.len(), 2);

        let tomorrow = today().succ_opt().unwrap();
        assert!(load_trip_line_map(&path, tomorrow).unwrap().is_none());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_live_rows_lag_only_defined_lines() {
        let now = at(1_765_531_800);
        let snapshot = Snapshot {
            timestamp: 1_765_531_790,
            entity: vec![delayed("T1", 60), delayed("T1", 120)],
        };
        let history = vec![
            DelayObservation {
                timestamp: at(1_765_530_900),
                line: LineName::Green,
                delay_current: Some(30.0),
            },
            DelayObservation {
                timestamp: at(1_765_530_000),
                line: LineName::Green,
                delay_current: Some(15.0),
            },
        ];

        let (labels, rows) = live_rows(
            Some(&snapshot),
            &map(),
            &LineName::ALL,
            &history,
            now,
            &[15, 30, 45],
        );

        assert_eq!(labels.len(), 3);
        assert_eq!(labels[0].avg_delay, Some(120.0));
        assert_eq!(labels[1].avg_delay, None);
        assert_eq!(
            rows,
            vec![LaggedFeatureRow {
                timestamp: now,
                line: LineName::Green,
                delay_current: Some(120.0),
                lags: vec![(15, Some(30.0)), (30, Some(15.0)), (45, None)],
            }]
        );
    }

    #[test]
    fn test_live_rows_without_snapshot() {
        let (labels, rows) = live_rows(None, &map(), &[LineName::Red], &[], at(0), &[15]);
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].avg_delay, None);
        assert!(rows.is_empty());
    }
}
