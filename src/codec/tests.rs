use super::*;
use crate::test_utils::{OtherDto, ReadingDto};
use crate::types::erase;

fn serializer() -> ProstSerializer {
    ProstSerializer::new().with::<ReadingDto>()
}

#[test]
fn test_typed_roundtrip() {
    let ser = serializer();
    let payload = erase(ReadingDto {
        value: 5,
        label: "five".to_string(),
    });

    let bytes = ser
        .serialize(&payload, ReadingDto::TYPE_TAG, "eid-1", "cid-1")
        .unwrap();
    let event = ser.deserialize(&bytes, Some(ReadingDto::TYPE_TAG)).unwrap();

    assert_eq!(event.event_id, "eid-1");
    assert_eq!(event.correlation_id, "cid-1");
    assert_eq!(event.type_tag, Some(ReadingDto::TYPE_TAG));
    let reading = event.payload_as::<ReadingDto>().unwrap().unwrap();
    assert_eq!(reading.value, 5);
    assert_eq!(reading.label, "five");
}

#[test]
fn test_signal_roundtrip_has_no_payload() {
    let ser = serializer();
    let bytes = ser.serialize_signal("eid", "cid").unwrap();

    let event = ser.deserialize(&bytes, None).unwrap();
    assert!(event.payload.is_none());
    assert_eq!(event.event_id, "eid");
    assert_eq!(event.correlation_id, "cid");
}

#[test]
fn test_signal_decoded_with_type_is_null_payload() {
    let ser = serializer();
    let bytes = ser.serialize_signal("eid", "cid").unwrap();

    let event = ser.deserialize(&bytes, Some(ReadingDto::TYPE_TAG)).unwrap();
    assert!(event.payload.is_none());
    assert!(event.payload_as::<ReadingDto>().unwrap().is_none());
}

#[test]
fn test_default_message_payload_survives() {
    // An all-default message encodes to zero bytes but is still a payload.
    let ser = serializer();
    let bytes = ser
        .serialize(&erase(ReadingDto::default()), ReadingDto::TYPE_TAG, "e", "c")
        .unwrap();

    let event = ser.deserialize(&bytes, Some(ReadingDto::TYPE_TAG)).unwrap();
    let reading = event.payload_as::<ReadingDto>().unwrap();
    assert_eq!(reading.as_deref(), Some(&ReadingDto::default()));
}

#[test]
fn test_empty_bytes_is_malformed() {
    let ser = serializer();
    let err = ser.deserialize(&[], None).unwrap_err();
    assert!(matches!(err, BusError::MalformedEnvelope(_)));
}

#[test]
fn test_missing_correlation_id_is_malformed() {
    let envelope = Envelope {
        payload: None,
        event_id: Some("eid".to_string()),
        correlation_id: None,
    };
    let err = serializer()
        .deserialize(&envelope.encode_to_vec(), None)
        .unwrap_err();
    assert!(matches!(err, BusError::MalformedEnvelope(ref m) if m.contains("correlation")));
}

#[test]
fn test_garbage_is_malformed() {
    let err = serializer()
        .deserialize(b"\xff\xff\xff\xff not protobuf", None)
        .unwrap_err();
    assert!(matches!(err, BusError::MalformedEnvelope(_)));
}

#[test]
fn test_serialize_unregistered_type_fails() {
    let ser = serializer();
    let err = ser
        .serialize(&erase(OtherDto::default()), OtherDto::TYPE_TAG, "e", "c")
        .unwrap_err();
    assert!(matches!(err, BusError::Serialization(ref m) if m.contains("no codec")));
}

#[test]
fn test_serialize_payload_of_wrong_type_fails() {
    let ser = serializer().with::<OtherDto>();
    let err = ser
        .serialize(&erase(OtherDto::default()), ReadingDto::TYPE_TAG, "e", "c")
        .unwrap_err();
    assert!(matches!(err, BusError::Serialization(_)));
}

#[test]
fn test_deserialize_with_unknown_tag_fails() {
    let ser = serializer();
    let bytes = ser
        .serialize(&erase(ReadingDto::default()), ReadingDto::TYPE_TAG, "e", "c")
        .unwrap();

    let err = ser.deserialize(&bytes, Some(OtherDto::TYPE_TAG)).unwrap_err();
    assert!(matches!(err, BusError::Serialization(_)));
}

#[test]
fn test_untyped_delivery_drops_payload() {
    let ser = serializer();
    let bytes = ser
        .serialize(&erase(ReadingDto { value: 1, label: String::new() }), ReadingDto::TYPE_TAG, "e", "c")
        .unwrap();

    let event = ser.deserialize(&bytes, None).unwrap();
    assert!(event.payload.is_none());
}

#[test]
fn test_knows_registered_types() {
    let ser = serializer();
    assert!(ser.knows(ReadingDto::TYPE_TAG));
    assert!(!ser.knows(OtherDto::TYPE_TAG));
}

#[test]
fn test_registered_codecs() {
    let mut ser = serializer();
    assert!(ser.knows(ReadingDto::TYPE_TAG));
    assert!(!ser.knows(OtherDto::TYPE_TAG));

    ser.register::<OtherDto>();
    assert!(ser.knows(OtherDto::TYPE_TAG));
}
