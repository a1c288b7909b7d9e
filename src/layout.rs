//! On-disk locations of captures, hourly aggregates, schedule outputs and
//! time-series logs, all below one data directory.

use crate::model::FeedKind;
use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::path::{Path, PathBuf};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// One local hour of one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HourKey {
    pub date: NaiveDate,
    pub hour: u32,
    pub feed: FeedKind,
}

impl HourKey {
    pub fn new(date: NaiveDate, hour: u32, feed: FeedKind) -> Self {
        Self { date, hour, feed }
    }

    /// The hour containing `timestamp` (POSIX seconds) in `tz`.
    pub fn containing(timestamp: u64, feed: FeedKind, tz: Tz) -> Option<Self> {
        let (date, hour) = local_hour(timestamp, tz)?;
        Some(Self::new(date, hour, feed))
    }

    pub fn contains(&self, timestamp: u64, tz: Tz) -> bool {
        local_hour(timestamp, tz) == Some((self.date, self.hour))
    }

    /// First instant of the hour, in UTC. `None` for an hour skipped by a
    /// daylight-saving jump.
    pub fn start(&self, tz: Tz) -> Option<DateTime<Utc>> {
        let naive = self.date.and_hms_opt(self.hour, 0, 0)?;
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Local calendar date and hour of `timestamp`.
pub fn local_hour(timestamp: u64, tz: Tz) -> Option<(NaiveDate, u32)> {
    let secs = i64::try_from(timestamp).ok()?;
    let local = DateTime::from_timestamp(secs, 0)?.with_timezone(&tz);
    Some((local.date_naive(), local.hour()))
}

#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn static_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join("static").join(date.format(DATE_FORMAT).to_string())
    }

    pub fn filtered_dir(&self, date: NaiveDate) -> PathBuf {
        self.static_dir(date).join("filtered")
    }

    pub fn static_archive(&self, date: NaiveDate) -> PathBuf {
        self.static_dir(date).join("gtfs.zip")
    }

    pub fn trip_line_map(&self) -> PathBuf {
        self.root.join("static").join("trip_line_map.csv")
    }

    pub fn realtime_dir(&self) -> PathBuf {
        self.root.join("realtime")
    }

    pub fn feed_dir(&self, date: NaiveDate, feed: FeedKind) -> PathBuf {
        self.realtime_dir()
            .join(date.format(DATE_FORMAT).to_string())
            .join(feed.as_str())
    }

    pub fn raw_dir(&self, key: &HourKey) -> PathBuf {
        self.feed_dir(key.date, key.feed)
            .join("raw")
            .join(format!("{:02}", key.hour))
    }

    /// Capture files are named by their zero-padded POSIX timestamp so that
    /// lexical order is capture order.
    pub fn capture_path(&self, key: &HourKey, timestamp: u64) -> PathBuf {
        self.raw_dir(key).join(format!("{timestamp:010}.pb"))
    }

    pub fn hourly_dir(&self, date: NaiveDate, feed: FeedKind) -> PathBuf {
        self.feed_dir(date, feed).join("hourly")
    }

    pub fn hourly_path(&self, key: &HourKey) -> PathBuf {
        self.hourly_dir(key.date, key.feed)
            .join(format!("{:02}.json", key.hour))
    }

    /// Written once both feature logs hold the rows of a local hour.
    pub fn extracted_marker(&self, date: NaiveDate, hour: u32) -> PathBuf {
        self.realtime_dir()
            .join(date.format(DATE_FORMAT).to_string())
            .join("extracted")
            .join(format!("{hour:02}"))
    }

    pub fn features_dir(&self) -> PathBuf {
        self.root.join("features")
    }

    pub fn vehicle_features(&self) -> PathBuf {
        self.features_dir().join("vehicle_features.csv")
    }

    pub fn hourly_delay_labels(&self) -> PathBuf {
        self.features_dir().join("hourly_delay_labels.csv")
    }

    pub fn delay_features(&self) -> PathBuf {
        self.features_dir().join("delay_features.csv")
    }

    pub fn delay_labels(&self) -> PathBuf {
        self.features_dir().join("delay_labels.csv")
    }
}

/// Parses a `YYYY-MM-DD` directory name.
pub fn parse_date_dir(name: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(name, DATE_FORMAT).ok()
}
