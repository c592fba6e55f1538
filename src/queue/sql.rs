//! Shared pieces of the relational backends.

use chrono::{DateTime, Utc};

use super::error::QueueError;
use super::message::Message;

/// Message columns in select order.
pub(crate) const COLUMNS: &str =
    "queue_id, msg_org_timestamp, msg_timestamp, msg_num_requeues, msg_content, msg_partition_key";

/// PostgreSQL identifier length limit.
const MAX_IDENTIFIER_LEN: usize = 63;

/// One message row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct QueueRow {
    pub queue_id: i64,
    pub msg_org_timestamp: DateTime<Utc>,
    pub msg_timestamp: DateTime<Utc>,
    pub msg_num_requeues: i32,
    pub msg_content: Vec<u8>,
    pub msg_partition_key: Option<String>,
}

impl From<QueueRow> for Message<i64> {
    fn from(row: QueueRow) -> Self {
        Message {
            id: Some(row.queue_id),
            payload: row.msg_content,
            original_timestamp: row.msg_org_timestamp,
            queue_timestamp: row.msg_timestamp,
            num_requeues: row.msg_num_requeues.max(0) as u32,
            partition_key: row.msg_partition_key,
        }
    }
}

/// Requeue counter as stored in an INTEGER column.
pub(crate) fn requeues_column(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Validate a table name before embedding it in SQL.
///
/// Accepts `table` or `schema.table`, each part an unquoted identifier.
pub(crate) fn validate_table_name(name: &str) -> Result<(), QueueError> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return Err(QueueError::InvalidConfig(format!(
            "invalid table name: {}",
            name
        )));
    }

    for part in parts {
        let mut chars = part.chars();
        let valid_start = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

        if !valid_start || !valid_rest || part.len() > MAX_IDENTIFIER_LEN {
            return Err(QueueError::InvalidConfig(format!(
                "invalid table name: {}",
                name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("queue").is_ok());
        assert!(validate_table_name("public.queue_ephemeral").is_ok());
        assert!(validate_table_name("_q1").is_ok());

        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1queue").is_err());
        assert!(validate_table_name("queue; DROP TABLE x").is_err());
        assert!(validate_table_name("a.b.c").is_err());
        assert!(validate_table_name("queue\"").is_err());
        assert!(validate_table_name(&"q".repeat(64)).is_err());
    }

    #[test]
    fn test_row_into_message() {
        let ts = crate::queue::message::now();
        let row = QueueRow {
            queue_id: 11,
            msg_org_timestamp: ts,
            msg_timestamp: ts,
            msg_num_requeues: 2,
            msg_content: b"body".to_vec(),
            msg_partition_key: Some("p".into()),
        };

        let msg: Message<i64> = row.into();
        assert_eq!(msg.id, Some(11));
        assert_eq!(msg.num_requeues, 2);
        assert_eq!(msg.payload_str(), Some("body"));
        assert_eq!(msg.partition_key.as_deref(), Some("p"));
    }

    #[test]
    fn test_requeues_column_saturates() {
        assert_eq!(requeues_column(3), 3);
        assert_eq!(requeues_column(u32::MAX), i32::MAX);
    }
}
