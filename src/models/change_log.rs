use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An append-only log entry recording one accepted change.
///
/// Records are written once, in the same transaction as the change they
/// describe, and never updated. `sequence` totally orders the whole log;
/// `channel_sequence` counts 1, 2, 3 … within the owning assembly and is the
/// number broadcast to subscribers of that assembly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub sequence: i64,
    pub channel_sequence: i64,
    pub type_name: String,
    pub assembly: Uuid,
    pub changed_ids: Vec<Uuid>,
    /// The change exactly as it was serialized for submission.
    pub change: serde_json::Value,
    pub user: String,
    /// Sequence of the record this change undid, if it is an undo.
    pub reverts: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Input for appending to the change log.
#[derive(Debug, Clone)]
pub struct NewChangeRecord {
    pub type_name: String,
    pub assembly: Uuid,
    pub changed_ids: Vec<Uuid>,
    pub change: serde_json::Value,
    pub user: String,
    pub reverts: Option<i64>,
}

/// What the broadcast hub relays to the other sessions of a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMessage {
    pub channel: String,
    pub sequence: i64,
    pub user: String,
    pub change: serde_json::Value,
}

impl ChangeMessage {
    pub fn from_record(record: &ChangeRecord) -> Self {
        Self {
            channel: record.assembly.to_string(),
            sequence: record.channel_sequence,
            user: record.user.clone(),
            change: record.change.clone(),
        }
    }
}
