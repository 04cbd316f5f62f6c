use super::*;
use crate::error::DecodeError;
use chrono::{Duration, TimeZone};
use serde_json::json;

fn position_at(device_id: EntityId, secs: i64, lat: f64) -> Position {
    Position {
        device_id,
        fix_time: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        latitude: lat,
        longitude: 13.4,
        speed: 12.0,
        course: 90.0,
        accuracy: 5.0,
        attributes: HashMap::new(),
    }
}

#[test]
fn test_merge_newer_timestamp_wins_regardless_of_order() {
    let older = EntitySnapshot::from_position(position_at(7, 0, 52.0));
    let newer = EntitySnapshot::from_position(position_at(7, 30, 52.5));

    let a = older.clone().merge(newer.clone());
    let b = newer.clone().merge(older.clone());

    assert_eq!(a.position.latitude, 52.5);
    assert_eq!(b.position.latitude, 52.5);
    assert_eq!(a.timestamp, newer.timestamp);
    assert_eq!(b.timestamp, newer.timestamp);
}

#[test]
fn test_merge_equal_timestamp_keeps_existing() {
    let existing = EntitySnapshot::from_position(position_at(7, 10, 1.0));
    let incoming = EntitySnapshot::from_position(position_at(7, 10, 2.0));

    assert!(!existing.is_superseded_by(&incoming));
    assert_eq!(existing.merge(incoming).position.latitude, 1.0);
}

#[test]
fn test_position_deserializes_traccar_shape() {
    let payload = json!({
        "id": 991,
        "deviceId": 3,
        "protocol": "osmand",
        "fixTime": "2024-05-01T10:00:00.000+00:00",
        "latitude": 48.85,
        "longitude": 2.35,
        "speed": 3.5,
        "course": 180.0,
        "attributes": { "batteryLevel": 80 }
    });

    let position: Position = serde_json::from_value(payload).unwrap();
    assert_eq!(position.device_id, 3);
    assert_eq!(position.accuracy, 0.0);
    assert_eq!(position.attributes["batteryLevel"], json!(80));
}

#[test]
fn test_device_status_unknown_value() {
    let device: Device = serde_json::from_value(json!({
        "id": 1,
        "name": "Truck 1",
        "status": "sleeping"
    }))
    .unwrap();
    assert_eq!(device.status, DeviceStatus::Unknown);
}

#[test]
fn test_decode_keepalive_is_valid() {
    let message = decode_message("{}").unwrap();
    assert!(message.is_empty());
}

#[test]
fn test_decode_full_message() {
    let text = json!({
        "devices": [{ "id": 1, "name": "Van", "uniqueId": "van-1", "status": "online" }],
        "positions": [{
            "deviceId": 1,
            "fixTime": "2024-05-01T10:00:00Z",
            "latitude": 1.0,
            "longitude": 2.0
        }],
        "events": [{ "type": "deviceOnline", "deviceId": 1 }]
    })
    .to_string();

    let message = decode_message(&text).unwrap();
    assert_eq!(message.devices.len(), 1);
    assert_eq!(message.devices[0].status, DeviceStatus::Online);
    assert_eq!(message.positions.len(), 1);
    assert_eq!(message.events.len(), 1);
}

#[test]
fn test_decode_rejects_non_object() {
    assert_eq!(decode_message("[1,2,3]"), Err(DecodeError::NotAnObject));
    assert!(matches!(
        decode_message("invalid-json-{]"),
        Err(DecodeError::InvalidJson(_))
    ));
}

#[test]
fn test_decode_rejects_bad_positions() {
    let result = decode_message(r#"{"positions": {"deviceId": 1}}"#);
    assert!(matches!(
        result,
        Err(DecodeError::InvalidField { field: "positions", .. })
    ));

    let result = decode_message(r#"{"positions": [{"deviceId": "x"}]}"#);
    assert!(matches!(
        result,
        Err(DecodeError::InvalidField { field: "positions", .. })
    ));
}

#[test]
fn test_from_position_stamps_last_update() {
    let before = Utc::now() - Duration::seconds(1);
    let snapshot = EntitySnapshot::from_position(position_at(4, 0, 0.0));
    assert_eq!(snapshot.id, 4);
    assert!(snapshot.last_update >= before);
}
