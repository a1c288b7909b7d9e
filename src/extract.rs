//! Per-line features and delay labels.
//!
//! Vehicle positions give speed, stop fraction and active trip count per
//! line; trip updates give the average delay at each trip's latest reported
//! stop. Lines without observations get no feature row and an undefined
//! delay, never a zero.

use crate::model::{
    DelayRecord, FeatureRecord, LineName, RealtimeEntity, Snapshot, StopTimeUpdate, TripLineMap,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

/// Speed (feed units, m/s) at or below which a vehicle counts as stopped.
pub const STOPPED_SPEED_THRESHOLD: f32 = 0.5;

#[derive(Debug, Default)]
struct LineStats<'a> {
    observations: usize,
    speed_sum: f64,
    stopped: usize,
    trips: HashSet<&'a str>,
}

impl LineStats<'_> {
    fn to_record(&self, timestamp: DateTime<Utc>, line: LineName) -> Option<FeatureRecord> {
        if self.observations == 0 {
            return None;
        }
        let n = self.observations as f64;
        Some(FeatureRecord {
            timestamp,
            line,
            avg_speed: self.speed_sum / n,
            active_trip_count: self.trips.len(),
            frac_stopped: self.stopped as f64 / n,
        })
    }
}

/// Feature rows for every line observed in `snapshots`, in line order.
///
/// Only entities carrying a vehicle position with a speed are observations.
/// Entities whose trip is not in `trip_lines` are ignored.
pub fn extract_features(
    snapshots: &[Snapshot],
    trip_lines: &TripLineMap,
    timestamp: DateTime<Utc>,
    stopped_threshold: f32,
) -> Vec<FeatureRecord> {
    let mut stats: BTreeMap<LineName, LineStats<'_>> = BTreeMap::new();

    for entity in snapshots.iter().flat_map(|s| &s.entity) {
        let Some(speed) = entity.vehicle.and_then(|v| v.speed) else {
            continue;
        };
        let Some(line) = trip_lines.line_of(&entity.trip_id) else {
            continue;
        };

        let s = stats.entry(line).or_default();
        s.observations += 1;
        s.speed_sum += f64::from(speed);
        s.trips.insert(&entity.trip_id);
        if speed <= stopped_threshold {
            s.stopped += 1;
        }
    }

    stats
        .iter()
        .filter_map(|(line, s)| s.to_record(timestamp, *line))
        .collect()
}

/// The stop-time update with the highest stop sequence. On equal sequences
/// the later update wins.
pub fn latest_stop(updates: &[StopTimeUpdate]) -> Option<&StopTimeUpdate> {
    updates
        .iter()
        .reduce(|best, u| if u.stop_sequence >= best.stop_sequence { u } else { best })
}

/// Delay reported at the entity's latest stop: arrival delay, else departure
/// delay, else nothing.
pub fn latest_stop_delay(entity: &RealtimeEntity) -> Option<i32> {
    let stop = latest_stop(&entity.stop_time_update)?;
    stop.arrival_delay.or(stop.departure_delay)
}

/// One delay label per line in `lines`, `avg_delay` left undefined for lines
/// without samples. Every entity with a delay is one sample.
pub fn extract_delays(
    snapshots: &[Snapshot],
    trip_lines: &TripLineMap,
    lines: &[LineName],
    timestamp: DateTime<Utc>,
) -> Vec<DelayRecord> {
    let mut samples: BTreeMap<LineName, Vec<f64>> = BTreeMap::new();

    for entity in snapshots.iter().flat_map(|s| &s.entity) {
        let Some(line) = trip_lines.line_of(&entity.trip_id) else {
            continue;
        };
        if let Some(delay) = latest_stop_delay(entity) {
            samples.entry(line).or_default().push(f64::from(delay));
        }
    }

    delay_records(&samples, lines, timestamp)
}

/// Delay labels from one live message. Each trip is one sample: the delay
/// of the last entity of that trip which reports one.
pub fn extract_live_delays(
    snapshot: Option<&Snapshot>,
    trip_lines: &TripLineMap,
    lines: &[LineName],
    timestamp: DateTime<Utc>,
) -> Vec<DelayRecord> {
    let mut per_trip: BTreeMap<&str, (LineName, i32)> = BTreeMap::new();

    for entity in snapshot.iter().flat_map(|s| &s.entity) {
        let Some(line) = trip_lines.line_of(&entity.trip_id) else {
            continue;
        };
        if let Some(delay) = latest_stop_delay(entity) {
            per_trip.insert(&entity.trip_id, (line, delay));
        }
    }

    let mut samples: BTreeMap<LineName, Vec<f64>> = BTreeMap::new();
    for (line, delay) in per_trip.into_values() {
        samples.entry(line).or_default().push(f64::from(delay));
    }

    delay_records(&samples, lines, timestamp)
}

fn delay_records(
    samples: &BTreeMap<LineName, Vec<f64>>,
    lines: &[LineName],
    timestamp: DateTime<Utc>,
) -> Vec<DelayRecord> {
    lines
        .iter()
        .map(|line| DelayRecord {
            timestamp,
            line: *line,
            avg_delay: samples.get(line).and_then(|d| mean(d)),
        })
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}
