use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Field carrying a frame's kind.
pub const KIND_FIELD: &str = "type";
/// Kind used for frames without a string `type` field.
pub const DEFAULT_KIND: &str = "message";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parsed inbound realtime frame.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundFrame {
    /// Dispatch key taken from the `type` field.
    pub kind: String,
    /// The whole decoded frame, `type` field included.
    pub body: Value,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let body: Value = serde_json::from_str(text)?;
        let kind = body
            .get(KIND_FIELD)
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_KIND)
            .to_string();
        Ok(Self { kind, body })
    }

    /// The frame's `payload` field, if present.
    pub fn payload(&self) -> Option<&Value> {
        self.body.get("payload")
    }

    /// Decodes the whole frame into a typed message.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, FrameError> {
        Ok(T::deserialize(&self.body)?)
    }
}

/// Tagged outbound frame: `{"type": kind, "payload": ...}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OutboundFrame<T = Value> {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: T,
}

impl<T> OutboundFrame<T> {
    pub fn new(kind: impl Into<String>, payload: T) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::{InboundFrame, OutboundFrame, DEFAULT_KIND};

    #[test]
    fn parses_kind_and_payload() {
        let frame = InboundFrame::parse(r#"{"type":"foo","payload":1}"#).expect("parse");
        assert_eq!(frame.kind, "foo");
        assert_eq!(frame.payload(), Some(&json!(1)));
    }

    #[test]
    fn missing_or_non_string_kind_uses_default() {
        let untagged = InboundFrame::parse(r#"{"payload":{"a":1}}"#).expect("parse");
        assert_eq!(untagged.kind, DEFAULT_KIND);

        let numeric = InboundFrame::parse(r#"{"type":7}"#).expect("parse");
        assert_eq!(numeric.kind, DEFAULT_KIND);

        let scalar = InboundFrame::parse("42").expect("parse");
        assert_eq!(scalar.kind, DEFAULT_KIND);
        assert_eq!(scalar.payload(), None);
    }

    #[test]
    fn rejects_non_json_text() {
        assert!(InboundFrame::parse("not json").is_err());
        assert!(InboundFrame::parse(r#"{"type":"foo""#).is_err());
        assert!(InboundFrame::parse("").is_err());
    }

    #[test]
    fn decodes_typed_messages() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Presence {
            user: String,
            online: bool,
        }

        let frame = InboundFrame::parse(r#"{"type":"presence","user":"u1","online":true}"#)
            .expect("parse");
        let presence: Presence = frame.decode().expect("decode");
        assert_eq!(
            presence,
            Presence {
                user: "u1".to_string(),
                online: true,
            }
        );
    }

    #[test]
    fn outbound_frame_serializes_type_tag() {
        let frame = OutboundFrame::new("chat", json!({"text": "hi"}));
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value, json!({"type": "chat", "payload": {"text": "hi"}}));
    }
}
