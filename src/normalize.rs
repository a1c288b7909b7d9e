//! Decoding of GTFS-Realtime captures into [`Snapshot`]s.

use prost::Message;

use crate::error::NormalizeError;
use crate::gtfs_rt::{self, FeedEntity, FeedMessage};
use crate::model::{RealtimeEntity, Snapshot, StopTimeUpdate, TripFilter, VehicleObservation};

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, NormalizeError> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Reduces a decoded message to the entities whose trip passes `trips`.
///
/// Returns `Ok(None)` when nothing relevant is left; such messages are never
/// stored.
pub fn normalize<F: TripFilter + ?Sized>(
    feed: &FeedMessage,
    trips: &F,
) -> Result<Option<Snapshot>, NormalizeError> {
    let timestamp = feed
        .header
        .timestamp
        .ok_or(NormalizeError::MissingTimestamp)?;

    let entity: Vec<RealtimeEntity> = feed
        .entity
        .iter()
        .filter(|e| !e.is_deleted.unwrap_or(false))
        .filter_map(to_entity)
        .filter(|e| trips.is_relevant(&e.trip_id))
        .collect();

    if entity.is_empty() {
        return Ok(None);
    }

    Ok(Some(Snapshot { timestamp, entity }))
}

/// [`parse_feed`] followed by [`normalize`].
pub fn normalize_bytes<F: TripFilter + ?Sized>(
    bytes: &[u8],
    trips: &F,
) -> Result<Option<Snapshot>, NormalizeError> {
    normalize(&parse_feed(bytes)?, trips)
}

fn trip_id(entity: &FeedEntity) -> Option<&str> {
    let from_update = entity
        .trip_update
        .as_ref()
        .and_then(|tu| tu.trip.trip_id.as_deref());
    let from_vehicle = entity
        .vehicle
        .as_ref()
        .and_then(|v| v.trip.as_ref())
        .and_then(|t| t.trip_id.as_deref());

    from_update.or(from_vehicle).filter(|id| !id.is_empty())
}

fn to_entity(entity: &FeedEntity) -> Option<RealtimeEntity> {
    let trip_id = trip_id(entity)?;

    let vehicle = entity
        .vehicle
        .as_ref()
        .and_then(|v| v.position.as_ref())
        .map(|p| VehicleObservation {
            latitude: p.latitude,
            longitude: p.longitude,
            speed: p.speed,
        });

    let stop_time_update = entity
        .trip_update
        .as_ref()
        .map(|tu| tu.stop_time_update.iter().map(to_stop_time_update).collect())
        .unwrap_or_default();

    Some(RealtimeEntity {
        id: entity.id.clone(),
        trip_id: trip_id.to_string(),
        vehicle,
        stop_time_update,
    })
}

fn to_stop_time_update(stu: &gtfs_rt::trip_update::StopTimeUpdate) -> StopTimeUpdate {
    StopTimeUpdate {
        stop_sequence: stu.stop_sequence.unwrap_or_default(),
        arrival_delay: stu.arrival.as_ref().and_then(|a| a.delay),
        departure_delay: stu.departure.as_ref().and_then(|d| d.delay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate as PbStopTimeUpdate};
    use crate::gtfs_rt::{FeedHeader, Position, TripDescriptor, TripUpdate, VehiclePosition};
    use std::collections::HashSet;

    fn header(timestamp: Option<u64>) -> FeedHeader {
        FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            timestamp,
            incrementality: None,
            feed_version: None,
        }
    }

    fn descriptor(trip_id: &str) -> TripDescriptor {
        TripDescriptor {
            trip_id: Some(trip_id.to_string()),
            ..Default::default()
        }
    }

    fn vehicle_entity(id: &str, trip_id: Option<&str>, speed: f32) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            vehicle: Some(VehiclePosition {
                trip: trip_id.map(descriptor),
                position: Some(Position {
                    latitude: 59.33,
                    longitude: 18.06,
                    bearing: None,
                    odometer: None,
                    speed: Some(speed),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn relevant() -> HashSet<String> {
        ["T1".to_string()].into()
    }

    #[test]
    fn test_parse_empty_bytes_returns_default_feed() {
        let feed = parse_feed(&[]).unwrap();
        assert_eq!(feed.header.gtfs_realtime_version, "");
        assert!(feed.entity.is_empty());
    }

    #[test]
    fn test_parse_invalid_bytes() {
        let result = parse_feed(&[0xFF, 0xFE, 0x00, 0x01]);
        assert!(matches!(result, Err(NormalizeError::Decode(_))));
    }

    #[test]
    fn test_drops_irrelevant_and_tripless_entities() {
        let feed = FeedMessage {
            header: header(Some(1_700_000_000)),
            entity: vec![
                vehicle_entity("1", Some("T1"), 4.0),
                vehicle_entity("2", Some("T9"), 4.0),
                vehicle_entity("3", None, 4.0),
                vehicle_entity("4", Some(""), 4.0),
            ],
        };

        let snapshot = normalize(&feed, &relevant()).unwrap().unwrap();
        assert_eq!(snapshot.timestamp, 1_700_000_000);
        assert_eq!(snapshot.entity.len(), 1);
        assert_eq!(snapshot.entity[0].id, "1");
        assert_eq!(snapshot.entity[0].vehicle.unwrap().speed, Some(4.0));
    }

    #[test]
    fn test_nothing_relevant_yields_no_snapshot() {
        let feed = FeedMessage {
            header: header(Some(1_700_000_000)),
            entity: vec![vehicle_entity("2", Some("T9"), 4.0)],
        };
        assert_eq!(normalize(&feed, &relevant()).unwrap(), None);
    }

    #[test]
    fn test_missing_header_timestamp() {
        let feed = FeedMessage {
            header: header(None),
            entity: vec![vehicle_entity("1", Some("T1"), 4.0)],
        };
        assert!(matches!(
            normalize(&feed, &relevant()),
            Err(NormalizeError::MissingTimestamp)
        ));
    }

    #[test]
    fn test_deleted_entities_are_dropped() {
        let mut entity = vehicle_entity("1", Some("T1"), 4.0);
        entity.is_deleted = Some(true);
        let feed = FeedMessage {
            header: header(Some(1)),
            entity: vec![entity],
        };
        assert_eq!(normalize(&feed, &relevant()).unwrap(), None);
    }

    #[test]
    fn test_trip_update_round_trip_through_bytes() {
        let feed = FeedMessage {
            header: header(Some(1_700_000_060)),
            entity: vec![FeedEntity {
                id: "tu1".to_string(),
                trip_update: Some(TripUpdate {
                    trip: descriptor("T1"),
                    stop_time_update: vec![
                        PbStopTimeUpdate {
                            stop_sequence: Some(3),
                            arrival: Some(StopTimeEvent {
                                delay: Some(60),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        PbStopTimeUpdate {
                            stop_sequence: None,
                            departure: Some(StopTimeEvent {
                                delay: Some(-5),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }),
                ..Default::default()
            }],
        };

        let snapshot = normalize_bytes(&feed.encode_to_vec(), &relevant())
            .unwrap()
            .unwrap();
        let updates = &snapshot.entity[0].stop_time_update;
        assert_eq!(snapshot.entity[0].trip_id, "T1");
        assert_eq!(snapshot.entity[0].vehicle, None);
        assert_eq!(
            updates,
            &vec![
                StopTimeUpdate {
                    stop_sequence: 3,
                    arrival_delay: Some(60),
                    departure_delay: None,
                },
                StopTimeUpdate {
                    stop_sequence: 0,
                    arrival_delay: None,
                    departure_delay: Some(-5),
                },
            ]
        );
    }
}
