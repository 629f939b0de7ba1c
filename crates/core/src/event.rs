use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::table::Table;
use crate::types::Row;

/// Schema name reported on every change event.
pub const DEFAULT_SCHEMA: &str = "public";

/// Kind of row change carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row change notification delivered to realtime subscribers.
///
/// `payload` holds the new row for inserts and updates and the removed row
/// for deletes. Updates additionally carry the previous row in `old_record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event: ChangeKind,
    pub schema: String,
    pub table: String,
    pub payload: Row,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Row>,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(event: ChangeKind, table: Table, payload: Row, at: DateTime<Utc>) -> Self {
        Self {
            event,
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.as_str().to_string(),
            payload,
            old_record: None,
            commit_timestamp: at,
        }
    }

    pub fn with_old_record(mut self, old: Row) -> Self {
        self.old_record = Some(old);
        self
    }

    /// Returns a compact summary suitable for log output.
    pub fn summary(&self) -> Value {
        json!({
            "event": self.event,
            "table": self.table,
            "id": self.payload.get("id"),
        })
    }
}

/// Receiver of change events emitted by the database.
pub trait ChangeSink: Send + Sync {
    fn publish(&self, event: ChangeEvent);
}
