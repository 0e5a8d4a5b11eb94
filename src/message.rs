//! Transported payload model.
//!
//! The wire body is an opaque byte blob produced by serializing a
//! `MessageBatch`. The bus itself only needs two things from it: a codec to
//! get bytes in and out, and a small metadata projection (session alias,
//! direction, message type, protocol) that the filter engine reads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metadata key for the session alias.
pub const SESSION_ALIAS_KEY: &str = "session_alias";
/// Metadata key for the message type.
pub const MESSAGE_TYPE_KEY: &str = "message_type";
/// Metadata key for the direction.
pub const DIRECTION_KEY: &str = "direction";
/// Metadata key for the protocol.
pub const PROTOCOL_KEY: &str = "protocol";

/// Direction of a message relative to the connected session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Incoming (from the counterparty).
    #[default]
    First,
    /// Outgoing (to the counterparty).
    Second,
}

impl Direction {
    /// String form used by the filter engine.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::First => "FIRST",
            Direction::Second => "SECOND",
        }
    }
}

/// A structured message with a parsed body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub session_alias: String,
    #[serde(default)]
    pub direction: Direction,
    pub message_type: String,
    #[serde(default)]
    pub protocol: String,
    /// Parsed body fields. Opaque to the bus.
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
}

/// A message carried as raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub session_alias: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub protocol: String,
    /// Raw body bytes. Opaque to the bus.
    #[serde(default)]
    pub body: Vec<u8>,
}

/// Either variant of a transported message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnyMessage {
    Parsed(ParsedMessage),
    Raw(RawMessage),
}

impl AnyMessage {
    /// Projects a metadata field by key.
    ///
    /// Unknown keys, and keys a variant does not carry, yield the empty
    /// string. An empty value fails every filter operation except EMPTY;
    /// this deliberately conflates "absent" with "present but empty".
    pub fn field_value(&self, key: &str) -> &str {
        match self {
            AnyMessage::Parsed(m) => match key {
                SESSION_ALIAS_KEY => &m.session_alias,
                MESSAGE_TYPE_KEY => &m.message_type,
                DIRECTION_KEY => m.direction.as_str(),
                PROTOCOL_KEY => &m.protocol,
                _ => "",
            },
            AnyMessage::Raw(m) => match key {
                SESSION_ALIAS_KEY => &m.session_alias,
                DIRECTION_KEY => m.direction.as_str(),
                PROTOCOL_KEY => &m.protocol,
                _ => "",
            },
        }
    }
}

/// An ordered group of messages delivered together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageGroup {
    pub messages: Vec<AnyMessage>,
}

/// The unit of publishing and delivery: a batch of message groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub groups: Vec<MessageGroup>,
}

impl MessageBatch {
    /// Serializes the batch into the opaque wire body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes a wire body back into a batch.
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Total number of messages across all groups.
    pub fn message_count(&self) -> usize {
        self.groups.iter().map(|g| g.messages.len()).sum()
    }
}

/// An event published to event-tagged pins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub body: Vec<u8>,
}

/// A batch of events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<Event>,
}

impl EventBatch {
    /// Serializes the batch into the opaque wire body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes a wire body back into a batch.
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Broker-side delivery metadata handed to listeners.
#[derive(Debug, Clone, Default)]
pub struct DeliveryMeta {
    /// Pin the subscription was resolved through.
    pub pin: String,
    /// Queue the delivery came from.
    pub queue: String,
    /// Consumer tag of the delivering consumer.
    pub consumer_tag: String,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// True if the broker flagged the delivery as redelivered.
    pub redelivered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(alias: &str, msg_type: &str) -> AnyMessage {
        AnyMessage::Parsed(ParsedMessage {
            session_alias: alias.to_string(),
            direction: Direction::Second,
            message_type: msg_type.to_string(),
            protocol: "fix".to_string(),
            fields: HashMap::new(),
        })
    }

    #[test]
    fn test_batch_round_trip() {
        let batch = MessageBatch {
            groups: vec![MessageGroup {
                messages: vec![
                    parsed("conn-a", "NewOrderSingle"),
                    AnyMessage::Raw(RawMessage {
                        session_alias: "conn-b".to_string(),
                        body: vec![1, 2, 3],
                        ..Default::default()
                    }),
                ],
            }],
        };
        let body = batch.encode().unwrap();
        assert_eq!(MessageBatch::decode(&body).unwrap(), batch);
    }

    #[test]
    fn test_field_projection_parsed() {
        let msg = parsed("conn-a", "Heartbeat");
        assert_eq!(msg.field_value(SESSION_ALIAS_KEY), "conn-a");
        assert_eq!(msg.field_value(MESSAGE_TYPE_KEY), "Heartbeat");
        assert_eq!(msg.field_value(DIRECTION_KEY), "SECOND");
        assert_eq!(msg.field_value(PROTOCOL_KEY), "fix");
    }

    #[test]
    fn test_field_projection_unknown_key_is_empty() {
        let msg = parsed("conn-a", "Heartbeat");
        assert_eq!(msg.field_value("no_such_field"), "");
    }

    #[test]
    fn test_raw_message_has_no_message_type() {
        let msg = AnyMessage::Raw(RawMessage {
            session_alias: "conn-a".to_string(),
            ..Default::default()
        });
        assert_eq!(msg.field_value(MESSAGE_TYPE_KEY), "");
        assert_eq!(msg.field_value(DIRECTION_KEY), "FIRST");
    }

    #[test]
    fn test_message_count_spans_groups() {
        let batch = MessageBatch {
            groups: vec![
                MessageGroup { messages: vec![parsed("a", "X")] },
                MessageGroup { messages: vec![parsed("b", "Y"), parsed("c", "Z")] },
            ],
        };
        assert_eq!(batch.message_count(), 3);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(MessageBatch::decode(b"not json").is_err());
    }
}
