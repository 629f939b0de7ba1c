//! In-memory stand-in for a hosted Postgres + PostgREST + object storage
//! backend. Tables hold typed records; callers reach them through the
//! immutable [`Query`] builder with an explicit [`AuthContext`].

pub mod bucket;
pub mod query;
pub mod select;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use applytrack_core::Clock;
use applytrack_core::{
    system_clock, AuthContext, ChangeEvent, ChangeSink, ConstraintError, Record, Row, Table,
};

pub use bucket::{
    Bucket, ObjectInfo, ObjectStorage, PublicUrl, StorageObjectError, UploadOptions, UploadedObject,
};
pub use query::{Order, Query};
pub use select::{Columns, Embed, SelectSpec};

/// How mutations react to rows that exist but belong to another identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RlsViolation {
    /// Rows outside the caller's policy are excluded; the mutation affects nothing.
    #[default]
    Skip,
    /// The mutation fails with `42501` when it targets any foreign row.
    Reject,
}

/// Top-level handle owning every table. Cloning shares the same data.
#[derive(Clone)]
pub struct MockDatabase {
    pub(crate) state: Arc<Mutex<DatabaseState>>,
    pub(crate) sink: Option<Arc<dyn ChangeSink>>,
    pub(crate) clock: Clock,
    pub(crate) latency: Duration,
    pub(crate) rls_violation: RlsViolation,
}

impl Default for MockDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDatabase {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DatabaseState::default())),
            sink: None,
            clock: system_clock(),
            latency: Duration::ZERO,
            rls_violation: RlsViolation::default(),
        }
    }

    /// Routes change events to the provided sink (usually the realtime harness).
    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Delay awaited before every terminal operation resolves.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_rls_violation(mut self, mode: RlsViolation) -> Self {
        self.rls_violation = mode;
        self
    }

    pub fn rls_violation(&self) -> RlsViolation {
        self.rls_violation
    }

    /// Starts a query against `table` on behalf of `auth`.
    pub fn from(&self, table: Table, auth: &AuthContext) -> Query {
        Query::new(self.clone(), table, auth.clone())
    }

    /// Number of rows stored in `table`, ignoring row-level security.
    pub fn count(&self, table: Table) -> usize {
        self.lock()
            .tables
            .get(&table)
            .map(|data| data.rows.len())
            .unwrap_or(0)
    }

    /// Returns every record of `table` in insertion order, ignoring row-level security.
    pub fn snapshot(&self, table: Table) -> Vec<Record> {
        self.lock()
            .tables
            .get(&table)
            .map(|data| data.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops all rows from every table.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.tables.clear();
        tracing::debug!(stage = "storage", "database reset");
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().expect("database state poisoned")
    }

    pub(crate) fn publish(&self, events: Vec<ChangeEvent>) {
        let Some(sink) = &self.sink else {
            return;
        };
        for event in events {
            sink.publish(event);
        }
    }
}

#[derive(Default)]
pub(crate) struct DatabaseState {
    pub(crate) tables: HashMap<Table, TableData>,
    last_stamp: Option<DateTime<Utc>>,
}

impl DatabaseState {
    /// Issues a timestamp strictly later than any previously issued one.
    pub(crate) fn next_timestamp(&mut self, clock: &Clock) -> DateTime<Utc> {
        let now = clock();
        let stamp = match self.last_stamp {
            Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    pub(crate) fn table(&self, table: Table) -> Option<&TableData> {
        self.tables.get(&table)
    }

    pub(crate) fn table_mut(&mut self, table: Table) -> &mut TableData {
        self.tables.entry(table).or_default()
    }

    pub(crate) fn get(&self, table: Table, id: &str) -> Option<&Record> {
        self.table(table).and_then(|data| data.rows.get(id))
    }
}

/// Rows of one table keyed by id, remembering insertion order.
#[derive(Default)]
pub(crate) struct TableData {
    pub(crate) rows: HashMap<String, Record>,
    order: Vec<String>,
}

impl TableData {
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Record> {
        self.order.iter().filter_map(|id| self.rows.get(id))
    }

    pub(crate) fn put(&mut self, record: Record) {
        let id = record.id().to_string();
        if self.rows.insert(id.clone(), record).is_none() {
            self.order.push(id);
        }
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Record> {
        let record = self.rows.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(record)
    }
}

/// Successful query payload.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
    Rows(Vec<Row>),
    Single(Option<Row>),
}

impl QueryData {
    pub fn rows(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            Self::Single(row) => row.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Rows(rows) => rows.len(),
            Self::Single(row) => usize::from(row.is_some()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes every returned row into `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Vec<T>, DbError> {
        self.rows()
            .into_iter()
            .map(|row| {
                serde_json::from_value(Value::Object(row))
                    .map_err(|err| DbError::Decode(err.to_string()))
            })
            .collect()
    }

    /// Decodes a single-row result into `T`.
    pub fn decode_one<T: DeserializeOwned>(self) -> Result<Option<T>, DbError> {
        Ok(self.decode::<T>()?.into_iter().next())
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Rows(rows) => Value::Array(rows.into_iter().map(Value::Object).collect()),
            Self::Single(Some(row)) => Value::Object(row),
            Self::Single(None) => Value::Null,
        }
    }
}

/// Errors surfaced by database operations. Each maps to a PostgREST/Postgres code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DbError {
    #[error("JSON object requested, no rows returned")]
    NoRows,
    #[error("JSON object requested, multiple ({0}) rows returned")]
    MultipleRows(usize),
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
    #[error("duplicate key value violates unique constraint \"{table}_pkey\" (id={id})")]
    DuplicateKey { table: Table, id: String },
    #[error("insert or update on table \"{table}\" violates foreign key constraint on \"{column}\"")]
    ForeignKey { table: Table, column: String },
    #[error("new row violates row-level security policy for table \"{table}\"")]
    RowLevelSecurity { table: Table },
    #[error("could not find a relationship between '{table}' and '{relation}'")]
    UnknownRelation { table: Table, relation: String },
    #[error("column {table}.{column} does not exist")]
    UnknownColumn { table: Table, column: String },
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("failed to decode row: {0}")]
    Decode(String),
}

impl DbError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoRows | Self::MultipleRows(_) => "PGRST116",
            Self::Constraint(ConstraintError::MissingColumn { .. }) => "23502",
            Self::Constraint(ConstraintError::InvalidValue { .. }) => "22P02",
            Self::DuplicateKey { .. } => "23505",
            Self::ForeignKey { .. } => "23503",
            Self::RowLevelSecurity { .. } => "42501",
            Self::UnknownRelation { .. } => "PGRST200",
            Self::UnknownColumn { .. } => "42703",
            Self::Malformed(_) => "PGRST100",
            Self::Decode(_) => "PGRST102",
        }
    }

    pub fn is_no_rows(&self) -> bool {
        matches!(self, Self::NoRows)
    }
}

/// Error object of the `{ data, error }` response envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl From<&DbError> for ApiError {
    fn from(err: &DbError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Client facing `{ data, error }` envelope. Exactly one side is populated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub data: Value,
    pub error: Option<ApiError>,
}

impl From<Result<QueryData, DbError>> for QueryResponse {
    fn from(result: Result<QueryData, DbError>) -> Self {
        match result {
            Ok(data) => Self {
                data: data.into_value(),
                error: None,
            },
            Err(err) => Self {
                data: Value::Null,
                error: Some(ApiError::from(&err)),
            },
        }
    }
}
