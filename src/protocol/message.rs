use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One request or response on the wire.
///
/// Every field is optional when decoding; missing ones take their default
/// (empty string, `null` payload, the Unix epoch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: JsonValue,
    pub time: DateTime<Utc>,
    /// Correlation identifier chosen by the client.
    pub id: String,
    /// Originator identifier.
    pub source: String,
}

/// Per-message transform applied between decode and encode.
pub type Transform = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// Overwrite `time` with the server's receive instant. Nothing else changes.
pub fn stamp_receive_time(mut msg: Message) -> Message {
    msg.time = Utc::now();
    msg
}

/// The transform servers use unless told otherwise.
pub fn default_transform() -> Transform {
    Arc::new(stamp_receive_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_wire_field_names() {
        let msg: Message = serde_json::from_str(
            r#"{"id":"m1","type":"data","source":"c1","payload":{"v":1}}"#,
        )
        .unwrap();

        assert_eq!(msg.id, "m1");
        assert_eq!(msg.kind, "data");
        assert_eq!(msg.source, "c1");
        assert_eq!(msg.payload, json!({"v": 1}));
        assert_eq!(msg.time, DateTime::<Utc>::default());
    }

    #[test]
    fn accepts_offset_timestamps() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"ping","time":"2024-05-01T12:00:00.5+02:00"}"#).unwrap();
        assert_eq!(msg.time.to_rfc3339(), "2024-05-01T10:00:00.500+00:00");
    }

    #[test]
    fn stamping_only_touches_time() {
        let sent = Utc::now();
        let original = Message {
            kind: "data".into(),
            payload: json!({"nested": {"list": [1, 2, 3]}}),
            time: sent,
            id: "m7".into(),
            source: "c9".into(),
        };

        let stamped = stamp_receive_time(original.clone());
        let wire = serde_json::to_string(&stamped).unwrap();
        let decoded: Message = serde_json::from_str(&wire).unwrap();

        assert_eq!(decoded.kind, original.kind);
        assert_eq!(decoded.payload, original.payload);
        assert_eq!(decoded.id, original.id);
        assert_eq!(decoded.source, original.source);
        assert!(decoded.time >= sent);
    }

    #[test]
    fn encodes_kind_as_type() {
        let wire = serde_json::to_value(Message {
            kind: "data".into(),
            ..Message::default()
        })
        .unwrap();
        assert_eq!(wire["type"], "data");
        assert!(wire.get("kind").is_none());
    }
}
