//! Static GTFS tables: loading the columns the resolver needs and writing
//! filtered copies of the full tables.

use crate::error::ResolveError;
use crate::model::{RelevantIdSets, RouteId, ShapeId, StopId, TripId};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const ROUTES: &str = "routes.txt";
pub const TRIPS: &str = "trips.txt";
pub const SHAPES: &str = "shapes.txt";
pub const STOP_TIMES: &str = "stop_times.txt";
pub const STOPS: &str = "stops.txt";

const UTF8_BOM: [u8; 3] = [0xef, 0xbb, 0xbf];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Route {
    pub route_id: RouteId,
    #[serde(default)]
    pub route_long_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Trip {
    pub route_id: RouteId,
    pub trip_id: TripId,
    #[serde(default)]
    pub shape_id: Option<ShapeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StopTime {
    pub trip_id: TripId,
    pub stop_id: StopId,
}

/// The parts of a static schedule the relevance cascade walks through.
#[derive(Debug, Clone, Default)]
pub struct StaticTables {
    pub routes: Vec<Route>,
    pub trips: Vec<Trip>,
    pub stop_times: Vec<StopTime>,
}

impl StaticTables {
    /// Reads `routes.txt`, `trips.txt` and `stop_times.txt` from an extracted
    /// GTFS directory. Ids are always kept as strings.
    pub fn load(dir: &Path) -> Result<Self, ResolveError> {
        let tables = StaticTables {
            routes: read_objs(&dir.join(ROUTES))?,
            trips: read_objs(&dir.join(TRIPS))?,
            stop_times: read_objs(&dir.join(STOP_TIMES))?,
        };
        debug!(
            routes = tables.routes.len(),
            trips = tables.trips.len(),
            stop_times = tables.stop_times.len(),
            "Static tables loaded"
        );
        Ok(tables)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("invalid_file_name")
        .to_string()
}

fn read_table(path: &Path) -> Result<Vec<u8>, ResolveError> {
    let mut bytes = fs::read(path).map_err(|e| ResolveError::NamedFileIO {
        file_name: file_name(path),
        source: e,
    })?;
    if bytes.starts_with(&UTF8_BOM) {
        bytes.drain(..UTF8_BOM.len());
    }
    Ok(bytes)
}

fn read_objs<O: DeserializeOwned>(path: &Path) -> Result<Vec<O>, ResolveError> {
    let bytes = read_table(path)?;
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Fields)
        .from_reader(bytes.as_slice());

    reader
        .deserialize()
        .collect::<Result<Vec<O>, _>>()
        .map_err(|e| ResolveError::CSVError {
            file_name: file_name(path),
            source: e,
        })
}

/// Copies the rows of `src` whose `column` value is in `keep` to `dst`,
/// header and row order preserved. An existing `dst` is left untouched and
/// `None` is returned.
pub fn filter_table(
    src: &Path,
    dst: &Path,
    column: &str,
    keep: &HashSet<String>,
) -> Result<Option<usize>, ResolveError> {
    if dst.exists() {
        debug!(path = %dst.display(), "Filtered table already present");
        return Ok(None);
    }

    let csv_err = |path: &Path| {
        let file_name = file_name(path);
        move |source: csv::Error| ResolveError::CSVError { file_name, source }
    };

    let bytes = read_table(src)?;
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes.as_slice());
    let headers = reader.headers().map_err(csv_err(src))?.clone();
    let idx = headers
        .iter()
        .position(|h| h.trim() == column)
        .ok_or_else(|| ResolveError::MissingColumn {
            file_name: file_name(src),
            column: column.to_string(),
        })?;

    let mut kept: Vec<StringRecord> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err(src))?;
        if record.get(idx).is_some_and(|v| keep.contains(v.trim())) {
            kept.push(record);
        }
    }

    let mut writer = WriterBuilder::new()
        .flexible(true)
        .from_path(dst)
        .map_err(csv_err(dst))?;
    writer.write_record(&headers).map_err(csv_err(dst))?;
    for record in &kept {
        writer.write_record(record).map_err(csv_err(dst))?;
    }
    writer.flush().map_err(|e| ResolveError::NamedFileIO {
        file_name: file_name(dst),
        source: e,
    })?;

    Ok(Some(kept.len()))
}

/// Writes filtered copies of the five schedule tables from `src_dir` into
/// `dst_dir`. `shapes.txt` is optional in GTFS and skipped when absent.
#[tracing::instrument(skip(ids), fields(src_dir = %src_dir.display(), dst_dir = %dst_dir.display()))]
pub fn filter_and_save(
    src_dir: &Path,
    dst_dir: &Path,
    ids: &RelevantIdSets,
) -> Result<(), ResolveError> {
    fs::create_dir_all(dst_dir).map_err(|e| ResolveError::NamedFileIO {
        file_name: dst_dir.display().to_string(),
        source: e,
    })?;

    let plan: [(&str, &str, &HashSet<String>); 5] = [
        (ROUTES, "route_id", &ids.route_ids),
        (TRIPS, "route_id", &ids.route_ids),
        (SHAPES, "shape_id", &ids.shape_ids),
        (STOP_TIMES, "trip_id", &ids.trip_ids),
        (STOPS, "stop_id", &ids.stop_ids),
    ];

    for (table, column, keep) in plan {
        let src = src_dir.join(table);
        if table == SHAPES && !src.exists() {
            debug!("No shapes table in schedule");
            continue;
        }
        if let Some(rows) = filter_table(&src, &dst_dir.join(table), column, keep)? {
            info!(table, rows, "Filtered table written");
        }
    }

    Ok(())
}
