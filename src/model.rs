//! Domain types shared by the resolver, normalizer, aggregator and extractor.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

pub type RouteId = String;
pub type TripId = String;
pub type ShapeId = String;
pub type StopId = String;

/// The metro lines the pipeline tracks. Every other line in the schedule is
/// irrelevant and filtered out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineName {
    Green,
    Red,
    Blue,
}

impl LineName {
    pub const ALL: [LineName; 3] = [LineName::Green, LineName::Red, LineName::Blue];

    /// Maps a GTFS `route_long_name` onto a tracked line.
    pub fn from_route_long_name(name: &str) -> Option<Self> {
        match name.trim() {
            "Gröna linjen" => Some(LineName::Green),
            "Röda linjen" => Some(LineName::Red),
            "Blå linjen" => Some(LineName::Blue),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LineName::Green => "green",
            LineName::Red => "red",
            LineName::Blue => "blue",
        }
    }
}

impl fmt::Display for LineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LineName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "green" => Ok(LineName::Green),
            "red" => Ok(LineName::Red),
            "blue" => Ok(LineName::Blue),
            other => Err(format!("unknown line '{other}'")),
        }
    }
}

/// The two realtime feeds the provider publishes that we consume. The
/// variant names double as the provider's feed path segment and as the
/// on-disk directory name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum FeedKind {
    VehiclePositions,
    TripUpdates,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::VehiclePositions => "VehiclePositions",
            FeedKind::TripUpdates => "TripUpdates",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one resolver run. Each set is derived from the previous one
/// through the static tables' foreign keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelevantIdSets {
    pub route_ids: HashSet<RouteId>,
    pub shape_ids: HashSet<ShapeId>,
    pub trip_ids: HashSet<TripId>,
    pub stop_ids: HashSet<StopId>,
}

/// Anything that can decide whether a realtime entity's trip belongs to a
/// tracked line.
pub trait TripFilter {
    fn is_relevant(&self, trip_id: &str) -> bool;
}

impl TripFilter for HashSet<TripId> {
    fn is_relevant(&self, trip_id: &str) -> bool {
        self.contains(trip_id)
    }
}

/// Trip id to line, valid for one schedule day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TripLineMap {
    lines: HashMap<TripId, LineName>,
}

impl TripLineMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `trip_id` to `line` unless it is already bound; returns whether
    /// the binding was inserted.
    pub fn bind_first(&mut self, trip_id: &str, line: LineName) -> bool {
        if self.lines.contains_key(trip_id) {
            return false;
        }
        self.lines.insert(trip_id.to_string(), line);
        true
    }

    pub fn line_of(&self, trip_id: &str) -> Option<LineName> {
        self.lines.get(trip_id).copied()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> BTreeSet<LineName> {
        self.lines.values().copied().collect()
    }

    /// Entries sorted by trip id, for stable persistence.
    pub fn sorted_entries(&self) -> Vec<(&str, LineName)> {
        let mut entries: Vec<_> = self
            .lines
            .iter()
            .map(|(trip, line)| (trip.as_str(), *line))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

impl TripFilter for TripLineMap {
    fn is_relevant(&self, trip_id: &str) -> bool {
        self.lines.contains_key(trip_id)
    }
}

impl FromIterator<(TripId, LineName)> for TripLineMap {
    fn from_iter<I: IntoIterator<Item = (TripId, LineName)>>(iter: I) -> Self {
        let mut map = TripLineMap::new();
        for (trip, line) in iter {
            map.bind_first(&trip, line);
        }
        map
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleObservation {
    pub latitude: f32,
    pub longitude: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTimeUpdate {
    pub stop_sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_delay: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_delay: Option<i32>,
}

/// One vehicle-position or trip-update record kept from a feed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEntity {
    pub id: String,
    pub trip_id: TripId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<VehicleObservation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_time_update: Vec<StopTimeUpdate>,
}

/// A capture reduced to relevant entities. Never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// POSIX seconds from the feed header.
    pub timestamp: u64,
    pub entity: Vec<RealtimeEntity>,
}

/// All snapshots of one feed for one local hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyAggregate {
    pub date: NaiveDate,
    pub hour: u32,
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub timestamp: DateTime<Utc>,
    pub line: LineName,
    pub avg_speed: f64,
    pub active_trip_count: usize,
    pub frac_stopped: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayRecord {
    pub timestamp: DateTime<Utc>,
    pub line: LineName,
    /// `None` when the line had no delay samples.
    pub avg_delay: Option<f64>,
}

/// Current delay of a line plus its look-back values, one per configured
/// offset in minutes.
#[derive(Debug, Clone, PartialEq)]
pub struct LaggedFeatureRow {
    pub timestamp: DateTime<Utc>,
    pub line: LineName,
    pub delay_current: Option<f64>,
    pub lags: Vec<(u32, Option<f64>)>,
}
