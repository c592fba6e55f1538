//! Wire form for byte-oriented backends.
//!
//! A message is encoded as a flat JSON object. Content is base64 so the record
//! stays textual; timestamps are epoch milliseconds.
//!
//! ```text
//! {"id":"42","org_ts":1700000000000,"ts":1700000000500,"num_requeues":1,
//!  "content":"aGVsbG8=","partition_key":null}
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::error::QueueError;
use super::message::{Message, MessageId};

/// Flat record as stored by the key-value backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Identity in textual form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Original timestamp (ms since epoch)
    pub org_ts: i64,

    /// Queue timestamp (ms since epoch)
    pub ts: i64,

    /// Requeue counter
    #[serde(default)]
    pub num_requeues: u32,

    /// Base64-encoded payload
    pub content: String,

    /// Optional partition key
    #[serde(default)]
    pub partition_key: Option<String>,
}

impl<I: MessageId> From<&Message<I>> for WireMessage {
    fn from(msg: &Message<I>) -> Self {
        Self {
            id: msg.id.as_ref().map(|id| id.to_string()),
            org_ts: msg.original_timestamp.timestamp_millis(),
            ts: msg.queue_timestamp.timestamp_millis(),
            num_requeues: msg.num_requeues,
            content: BASE64.encode(&msg.payload),
            partition_key: msg.partition_key.clone(),
        }
    }
}

impl WireMessage {
    /// Convert back into a message.
    pub fn into_message<I: MessageId>(self) -> Result<Message<I>, QueueError> {
        let label = self.id.clone().unwrap_or_else(|| "-".to_string());
        let fail = |reason: String| QueueError::Deserialization {
            id: label.clone(),
            reason,
        };

        let id = self.id.as_deref().map(I::parse).transpose().map_err(&fail)?;
        let payload = BASE64
            .decode(self.content.as_bytes())
            .map_err(|e| fail(format!("invalid content: {}", e)))?;
        let original_timestamp = millis_to_datetime(self.org_ts)
            .ok_or_else(|| fail(format!("invalid org_ts: {}", self.org_ts)))?;
        let queue_timestamp = millis_to_datetime(self.ts)
            .ok_or_else(|| fail(format!("invalid ts: {}", self.ts)))?;

        Ok(Message {
            id,
            payload,
            original_timestamp,
            queue_timestamp,
            num_requeues: self.num_requeues,
            partition_key: self.partition_key,
        })
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Encode a message into its wire form.
pub fn serialize<I: MessageId>(msg: &Message<I>) -> Result<String, QueueError> {
    Ok(serde_json::to_string(&WireMessage::from(msg))?)
}

/// Decode a message from its wire form.
pub fn deserialize<I: MessageId>(raw: &str) -> Result<Message<I>, QueueError> {
    let wire: WireMessage = serde_json::from_str(raw).map_err(|e| QueueError::Deserialization {
        id: "-".to_string(),
        reason: e.to_string(),
    })?;
    wire.into_message()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::message::now;

    #[test]
    fn test_round_trip_preserves_all_fields() {
        let mut msg = Message::with_id(42i64, vec![0u8, 159, 146, 150, 255]).partition_key("p-7");
        msg.num_requeues = 3;
        msg.queue_timestamp = now() + chrono::Duration::milliseconds(1500);

        let raw = serialize(&msg).unwrap();
        let back: Message<i64> = deserialize(&raw).unwrap();

        assert_eq!(back, msg);
    }

    #[test]
    fn test_wire_layout() {
        let msg = Message::with_id("tok-1".to_string(), "hello");
        let raw = serialize(&msg).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["id"], "tok-1");
        assert_eq!(value["content"], "aGVsbG8=");
        assert_eq!(value["num_requeues"], 0);
        assert_eq!(value["org_ts"], msg.original_timestamp.timestamp_millis());
        assert!(value["partition_key"].is_null());
    }

    #[test]
    fn test_missing_id_is_omitted() {
        let msg: Message<i64> = Message::new("x");
        let raw = serialize(&msg).unwrap();
        assert!(!raw.contains("\"id\""));

        let back: Message<i64> = deserialize(&raw).unwrap();
        assert!(back.id.is_none());
    }

    #[test]
    fn test_invalid_json_is_deserialization_error() {
        let err = deserialize::<i64>("not json").unwrap_err();
        assert!(matches!(err, QueueError::Deserialization { .. }));
    }

    #[test]
    fn test_invalid_content_names_the_message() {
        let raw = r#"{"id":"9","org_ts":0,"ts":0,"content":"***","partition_key":null}"#;
        let err = deserialize::<i64>(raw).unwrap_err();

        match err {
            QueueError::Deserialization { id, reason } => {
                assert_eq!(id, "9");
                assert!(reason.contains("invalid content"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_id_for_identity_type() {
        let raw = r#"{"id":"abc","org_ts":0,"ts":0,"content":""}"#;
        let err = deserialize::<i64>(raw).unwrap_err();
        assert!(matches!(err, QueueError::Deserialization { id, .. } if id == "abc"));
    }
}
