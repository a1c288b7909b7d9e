//! Relevance cascade over the static schedule.
//!
//! Each stage only looks at the ids produced by the stage before it:
//! line names select routes, routes select trips (and their shapes), trips
//! select stop times (and their stops). The trip-to-line map is then built
//! by joining the relevant trips back to their route names.

use crate::error::ResolveError;
use crate::model::{LineName, RelevantIdSets, RouteId, ShapeId, StopId, TripId, TripLineMap};
use crate::schedule::{Route, StaticTables, StopTime, Trip};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

/// Output of one resolver run, valid for one schedule day.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub ids: RelevantIdSets,
    pub trip_lines: TripLineMap,
}

/// Ids of routes whose long name is one of `lines`.
pub fn relevant_route_ids(routes: &[Route], lines: &BTreeSet<LineName>) -> HashSet<RouteId> {
    routes
        .iter()
        .filter(|r| {
            LineName::from_route_long_name(&r.route_long_name).is_some_and(|l| lines.contains(&l))
        })
        .map(|r| r.route_id.clone())
        .collect()
}

/// Trips running on `route_ids`, and the shapes those trips use.
pub fn relevant_trips(
    trips: &[Trip],
    route_ids: &HashSet<RouteId>,
) -> (HashSet<TripId>, HashSet<ShapeId>) {
    let mut trip_ids = HashSet::new();
    let mut shape_ids = HashSet::new();

    for trip in trips.iter().filter(|t| route_ids.contains(&t.route_id)) {
        trip_ids.insert(trip.trip_id.clone());
        if let Some(shape_id) = trip.shape_id.as_ref().filter(|s| !s.is_empty()) {
            shape_ids.insert(shape_id.clone());
        }
    }

    (trip_ids, shape_ids)
}

/// Stops served by `trip_ids`.
pub fn relevant_stop_ids(stop_times: &[StopTime], trip_ids: &HashSet<TripId>) -> HashSet<StopId> {
    stop_times
        .iter()
        .filter(|st| trip_ids.contains(&st.trip_id))
        .map(|st| st.stop_id.clone())
        .collect()
}

/// Maps every trip running on `route_ids` to its line.
///
/// Only rows on a relevant route take part, as in the filtered trips table.
/// A trip id that appears on several of those rows is bound by the first
/// one; later rows never rebind it. A relevant route missing from `routes`
/// means the tables are inconsistent and the whole run fails.
pub fn trip_line_map(
    routes: &[Route],
    trips: &[Trip],
    route_ids: &HashSet<RouteId>,
) -> Result<TripLineMap, ResolveError> {
    let route_names: HashMap<&str, &str> = routes
        .iter()
        .map(|r| (r.route_id.as_str(), r.route_long_name.as_str()))
        .collect();

    let mut map = TripLineMap::new();
    for trip in trips.iter().filter(|t| route_ids.contains(&t.route_id)) {
        if map.line_of(&trip.trip_id).is_some() {
            continue;
        }
        let route_long_name =
            route_names
                .get(trip.route_id.as_str())
                .ok_or_else(|| ResolveError::UnknownRoute {
                    trip_id: trip.trip_id.clone(),
                    route_id: trip.route_id.clone(),
                })?;
        let Some(line) = LineName::from_route_long_name(route_long_name) else {
            debug!(route_id = %trip.route_id, %route_long_name, "Route is not a tracked line");
            continue;
        };
        map.bind_first(&trip.trip_id, line);
    }

    Ok(map)
}

/// Runs the full cascade for `lines`.
#[tracing::instrument(skip_all, fields(lines = ?lines))]
pub fn resolve(
    tables: &StaticTables,
    lines: &BTreeSet<LineName>,
) -> Result<Resolution, ResolveError> {
    let route_ids = relevant_route_ids(&tables.routes, lines);
    let (trip_ids, shape_ids) = relevant_trips(&tables.trips, &route_ids);
    let stop_ids = relevant_stop_ids(&tables.stop_times, &trip_ids);
    let trip_lines = trip_line_map(&tables.routes, &tables.trips, &route_ids)?;

    info!(
        routes = route_ids.len(),
        trips = trip_ids.len(),
        shapes = shape_ids.len(),
        stops = stop_ids.len(),
        "Relevant ids resolved"
    );

    Ok(Resolution {
        ids: RelevantIdSets {
            route_ids,
            shape_ids,
            trip_ids,
            stop_ids,
        },
        trip_lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TripFilter;

    fn route(id: &str, name: &str) -> Route {
        Route {
            route_id: id.to_string(),
            route_long_name: name.to_string(),
        }
    }

    fn trip(route_id: &str, trip_id: &str, shape_id: &str) -> Trip {
        Trip {
            route_id: route_id.to_string(),
            trip_id: trip_id.to_string(),
            shape_id: Some(shape_id.to_string()),
        }
    }

    fn stop_time(trip_id: &str, stop_id: &str) -> StopTime {
        StopTime {
            trip_id: trip_id.to_string(),
            stop_id: stop_id.to_string(),
        }
    }

    fn sample_tables() -> StaticTables {
        StaticTables {
            routes: vec![
                route("10", "Gröna linjen"),
                route("13", "Röda linjen"),
                route("800", "Buss 4"),
            ],
            trips: vec![
                trip("10", "T1", "S1"),
                trip("13", "T2", "S2"),
                trip("800", "B1", "S9"),
            ],
            stop_times: vec![
                stop_time("T1", "A"),
                stop_time("T1", "B"),
                stop_time("T2", "B"),
                stop_time("B1", "Z"),
            ],
        }
    }

    fn all_lines() -> BTreeSet<LineName> {
        LineName::ALL.into_iter().collect()
    }

    #[test]
    fn test_cascade_keeps_only_relevant_ids() {
        let tables = sample_tables();
        let res = resolve(&tables, &all_lines()).unwrap();

        let set = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<HashSet<_>>();
        assert_eq!(res.ids.route_ids, set(&["10", "13"]));
        assert_eq!(res.ids.trip_ids, set(&["T1", "T2"]));
        assert_eq!(res.ids.shape_ids, set(&["S1", "S2"]));
        assert_eq!(res.ids.stop_ids, set(&["A", "B"]));

        assert_eq!(res.trip_lines.line_of("T1"), Some(LineName::Green));
        assert_eq!(res.trip_lines.line_of("T2"), Some(LineName::Red));
        assert!(!res.trip_lines.is_relevant("B1"));
    }

    #[test]
    fn test_cascade_is_strict() {
        let tables = sample_tables();
        let res = resolve(&tables, &all_lines()).unwrap();

        for t in &tables.trips {
            if res.ids.trip_ids.contains(&t.trip_id) {
                assert!(res.ids.route_ids.contains(&t.route_id));
            }
        }
        let trip_shapes: HashSet<_> = tables
            .trips
            .iter()
            .filter(|t| res.ids.trip_ids.contains(&t.trip_id))
            .filter_map(|t| t.shape_id.clone())
            .collect();
        assert!(res.ids.shape_ids.is_subset(&trip_shapes));
        let trip_stops: HashSet<_> = tables
            .stop_times
            .iter()
            .filter(|st| res.ids.trip_ids.contains(&st.trip_id))
            .map(|st| st.stop_id.clone())
            .collect();
        assert!(res.ids.stop_ids.is_subset(&trip_stops));
        assert_eq!(res.trip_lines.len(), res.ids.trip_ids.len());
    }

    #[test]
    fn test_subset_of_lines() {
        let tables = sample_tables();
        let lines: BTreeSet<_> = [LineName::Red].into();
        let res = resolve(&tables, &lines).unwrap();

        assert_eq!(res.ids.trip_ids.len(), 1);
        assert_eq!(res.trip_lines.line_of("T2"), Some(LineName::Red));
        assert_eq!(res.trip_lines.line_of("T1"), None);
    }

    #[test]
    fn test_first_seen_route_wins() {
        let mut tables = sample_tables();
        tables.trips.push(trip("13", "T1", "S2"));

        let res = resolve(&tables, &all_lines()).unwrap();
        assert_eq!(res.trip_lines.line_of("T1"), Some(LineName::Green));
    }

    #[test]
    fn test_unknown_route_is_fatal() {
        let tables = sample_tables();
        let route_ids: HashSet<RouteId> = ["10".to_string(), "999".to_string()].into();
        let mut trips = tables.trips.clone();
        trips.insert(0, trip("999", "T1", "S1"));

        let err = trip_line_map(&tables.routes, &trips, &route_ids).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::UnknownRoute { ref trip_id, ref route_id } if trip_id == "T1" && route_id == "999"
        ));
    }

    #[test]
    fn test_rows_on_other_routes_do_not_bind() {
        let mut tables = sample_tables();
        tables.trips.insert(0, trip("800", "T2", "S9"));

        let res = resolve(&tables, &all_lines()).unwrap();
        assert_eq!(res.trip_lines.line_of("T2"), Some(LineName::Red));
        assert_eq!(res.trip_lines.len(), 2);
    }

    #[test]
    fn test_missing_shape_is_not_collected() {
        let tables = StaticTables {
            routes: vec![route("10", "Gröna linjen")],
            trips: vec![Trip {
                route_id: "10".to_string(),
                trip_id: "T1".to_string(),
                shape_id: None,
            }],
            stop_times: vec![],
        };
        let res = resolve(&tables, &all_lines()).unwrap();
        assert!(res.ids.shape_ids.is_empty());
        assert!(res.ids.stop_ids.is_empty());
    }
}
