use std::{cmp::Ordering, collections::HashSet};

use metrics::counter;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use applytrack_core::{
    filter::{compare_values, parse_value},
    AuthContext, ChangeEvent, ChangeKind, Filter, OnDelete, Operator, Record, RelationKind, Row,
    Table,
};

use crate::select::{references, SelectSpec};
use crate::{Clock, DatabaseState, DbError, MockDatabase, QueryData, QueryResponse, RlsViolation};

/// Immutable query builder.
///
/// Every method consumes the builder and returns a new one with the
/// operation appended; the table is only read or written by [`Query::execute`].
#[derive(Clone)]
pub struct Query {
    db: MockDatabase,
    table: Table,
    auth: AuthContext,
    action: Action,
    filters: Vec<Filter>,
    orders: Vec<Order>,
    range: Option<(usize, usize)>,
    limit: Option<usize>,
    select: Option<String>,
    cardinality: Cardinality,
}

#[derive(Debug, Clone)]
enum Action {
    Select,
    Insert(Value),
    Upsert(Value),
    Update(Value),
    Delete,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert(_) => "insert",
            Self::Upsert(_) => "upsert",
            Self::Update(_) => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cardinality {
    Many,
    Single,
    MaybeSingle,
}

/// Sort key applied at resolution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

type Staged = (Vec<Row>, Vec<ChangeEvent>);

impl Query {
    pub(crate) fn new(db: MockDatabase, table: Table, auth: AuthContext) -> Self {
        Self {
            db,
            table,
            auth,
            action: Action::Select,
            filters: Vec::new(),
            orders: Vec::new(),
            range: None,
            limit: None,
            select: None,
            cardinality: Cardinality::Many,
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Chooses the returned columns and embedded relations.
    pub fn select(mut self, columns: &str) -> Self {
        self.select = Some(columns.to_string());
        self
    }

    /// Inserts an object or an array of objects.
    pub fn insert(mut self, rows: Value) -> Self {
        self.action = Action::Insert(rows);
        self
    }

    /// Inserts a typed payload such as [`applytrack_core::NewApplication`].
    pub fn insert_record<T: Serialize>(self, record: &T) -> Self {
        let value = serde_json::to_value(record).unwrap_or(Value::Null);
        self.insert(value)
    }

    /// Inserts rows, updating those whose id already exists.
    pub fn upsert(mut self, rows: Value) -> Self {
        self.action = Action::Upsert(rows);
        self
    }

    pub fn update(mut self, patch: Value) -> Self {
        self.action = Action::Update(patch);
        self
    }

    pub fn delete(mut self) -> Self {
        self.action = Action::Delete;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::compare(column, Operator::Eq, value))
    }

    pub fn neq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::compare(column, Operator::Neq, value))
    }

    pub fn gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::compare(column, Operator::Gt, value))
    }

    pub fn gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::compare(column, Operator::Gte, value))
    }

    pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::compare(column, Operator::Lt, value))
    }

    pub fn lte(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::compare(column, Operator::Lte, value))
    }

    pub fn like(self, column: &str, pattern: &str) -> Self {
        self.filter(Filter::compare(column, Operator::Like, pattern))
    }

    pub fn ilike(self, column: &str, pattern: &str) -> Self {
        self.filter(Filter::compare(column, Operator::ILike, pattern))
    }

    pub fn in_<V: Into<Value>>(self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.filter(Filter::compare(column, Operator::In, Value::Array(values)))
    }

    pub fn is(self, column: &str, value: Value) -> Self {
        self.filter(Filter::compare(column, Operator::Is, value))
    }

    /// Negates a single condition, e.g. `not("status", "in", "(rejected,ghosted)")`.
    /// An unknown operator leaves the query unfiltered.
    pub fn not(self, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        let Some(op) = Operator::parse(operator) else {
            warn!(stage = "storage", table = %self.table, operator, "ignoring not() with unknown operator");
            return self;
        };
        let value = match (op, value.into()) {
            (Operator::In | Operator::Is, Value::String(raw)) => parse_value(op, &raw),
            (_, value) => Ok(value),
        };
        match value {
            Ok(value) => self.filter(Filter::Not(Box::new(Filter::compare(column, op, value)))),
            Err(err) => {
                warn!(stage = "storage", table = %self.table, error = %err, "ignoring malformed not() value");
                self
            }
        }
    }

    /// Adds a PostgREST logic expression. A malformed expression leaves the query unfiltered.
    pub fn or(self, expression: &str) -> Self {
        match Filter::parse_or(expression) {
            Ok(filter) => self.filter(filter),
            Err(err) => {
                warn!(stage = "storage", table = %self.table, expression, error = %err, "ignoring malformed or() filter");
                self
            }
        }
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.orders.push(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    /// Inclusive zero-based row window.
    pub fn range(mut self, from: usize, to: usize) -> Self {
        self.range = Some((from, to));
        self
    }

    pub fn limit(mut self, count: usize) -> Self {
        self.limit = Some(count);
        self
    }

    /// Requires exactly one row.
    pub fn single(mut self) -> Self {
        self.cardinality = Cardinality::Single;
        self
    }

    /// Accepts zero or one row.
    pub fn maybe_single(mut self) -> Self {
        self.cardinality = Cardinality::MaybeSingle;
        self
    }

    /// Resolves the query into the `{ data, error }` envelope.
    pub async fn respond(self) -> QueryResponse {
        QueryResponse::from(self.execute().await)
    }

    /// Resolves the query.
    pub async fn execute(self) -> Result<QueryData, DbError> {
        if !self.db.latency.is_zero() {
            tokio::time::sleep(self.db.latency).await;
        }

        let result = self.run();
        match &result {
            Ok((rows, events)) => {
                debug!(
                    stage = "storage",
                    table = %self.table,
                    op = self.action.as_str(),
                    role = self.auth.as_str(),
                    rows = rows.len(),
                    events = events.len(),
                    "query resolved"
                );
            }
            Err(err) => {
                debug!(
                    stage = "storage",
                    table = %self.table,
                    op = self.action.as_str(),
                    role = self.auth.as_str(),
                    code = err.code(),
                    error = %err,
                    "query failed"
                );
            }
        }

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.code(),
        };
        counter!(
            "db_operations_total",
            "table" => self.table.as_str(),
            "op" => self.action.as_str(),
            "result" => outcome
        )
        .increment(1);

        let (rows, events) = result?;
        self.db.publish(events);
        self.shape(rows)
    }

    fn run(&self) -> Result<Staged, DbError> {
        let spec = match &self.select {
            Some(raw) => SelectSpec::parse(raw)?,
            None => SelectSpec::default(),
        };
        if let Some((from, to)) = self.range {
            if to < from {
                return Err(DbError::Malformed(format!(
                    "range end {to} precedes start {from}"
                )));
            }
        }

        let mut state = self.db.lock();
        match &self.action {
            Action::Select => Ok((self.run_select(&state, &spec)?, Vec::new())),
            Action::Insert(payload) => self.run_insert(&mut state, &spec, payload, false),
            Action::Upsert(payload) => self.run_insert(&mut state, &spec, payload, true),
            Action::Update(patch) => self.run_update(&mut state, &spec, patch),
            Action::Delete => self.run_delete(&mut state, &spec),
        }
    }

    fn shape(&self, mut rows: Vec<Row>) -> Result<QueryData, DbError> {
        match (self.cardinality, rows.len()) {
            (Cardinality::Many, _) => Ok(QueryData::Rows(rows)),
            (Cardinality::Single, 0) => Err(DbError::NoRows),
            (Cardinality::MaybeSingle, 0) => Ok(QueryData::Single(None)),
            (_, 1) => Ok(QueryData::Single(rows.pop())),
            (_, count) => Err(DbError::MultipleRows(count)),
        }
    }

    /// Rejects a mutation up front when its row count cannot satisfy `single()`.
    fn check_cardinality(&self, count: usize) -> Result<(), DbError> {
        match (self.cardinality, count) {
            (Cardinality::Single, 0) => Err(DbError::NoRows),
            (Cardinality::Single | Cardinality::MaybeSingle, count) if count > 1 => {
                Err(DbError::MultipleRows(count))
            }
            _ => Ok(()),
        }
    }

    fn clock(&self) -> &Clock {
        &self.db.clock
    }

    fn matches_filters(&self, row: &Row) -> bool {
        self.filters.iter().all(|filter| filter.matches(row))
    }

    fn run_select(&self, state: &DatabaseState, spec: &SelectSpec) -> Result<Vec<Row>, DbError> {
        let mut matched: Vec<(&Record, Row)> = state
            .table(self.table)
            .map(|data| {
                data.iter()
                    .filter(|record| self.auth.can_access(record.owner()))
                    .map(|record| (record, record.to_row()))
                    .filter(|(_, row)| self.matches_filters(row))
                    .collect()
            })
            .unwrap_or_default();

        if !self.orders.is_empty() {
            matched.sort_by(|(_, a), (_, b)| compare_rows(a, b, &self.orders));
        }

        paginate(matched, self.range, self.limit)
            .into_iter()
            .map(|(record, _)| spec.render(state, record, &self.auth))
            .collect()
    }

    /// Splits filter matches into rows the caller may mutate and rows it may not.
    fn partition_targets(&self, state: &DatabaseState) -> Result<Vec<Record>, DbError> {
        let (allowed, denied): (Vec<Record>, Vec<Record>) = state
            .table(self.table)
            .map(|data| {
                data.iter()
                    .filter(|record| self.matches_filters(&record.to_row()))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
            .into_iter()
            .partition(|record| self.auth.can_access(record.owner()));

        if !denied.is_empty() {
            if self.db.rls_violation == RlsViolation::Reject {
                return Err(DbError::RowLevelSecurity { table: self.table });
            }
            debug!(
                stage = "storage",
                table = %self.table,
                skipped = denied.len(),
                "rows outside row-level security policy skipped"
            );
        }
        Ok(allowed)
    }

    fn run_insert(
        &self,
        state: &mut DatabaseState,
        spec: &SelectSpec,
        payload: &Value,
        upsert: bool,
    ) -> Result<Staged, DbError> {
        let incoming = payload_rows(payload)?;
        let mut staged: Vec<(Record, Option<Record>)> = Vec::with_capacity(incoming.len());
        let mut seen = HashSet::new();

        for mut row in incoming {
            self.apply_owner(&mut row)?;
            let id = match row.get("id").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => Uuid::new_v4().to_string(),
            };
            row.insert("id".into(), Value::String(id.clone()));
            if !seen.insert(id.clone()) {
                return Err(DbError::DuplicateKey {
                    table: self.table,
                    id,
                });
            }

            let stamp = json!(state.next_timestamp(self.clock()));
            match state.get(self.table, &id).cloned() {
                Some(existing) if upsert => {
                    if !self.auth.can_access(existing.owner()) {
                        return Err(DbError::RowLevelSecurity { table: self.table });
                    }
                    let mut merged = existing.to_row();
                    merge_patch(self.table, &mut merged, &row)?;
                    merged.insert("updated_at".into(), stamp);
                    let record = self.validate(state, &merged)?;
                    staged.push((record, Some(existing)));
                }
                Some(_) => {
                    return Err(DbError::DuplicateKey {
                        table: self.table,
                        id,
                    })
                }
                None => {
                    row.insert("created_at".into(), stamp.clone());
                    row.insert("updated_at".into(), stamp);
                    let record = self.validate(state, &row)?;
                    staged.push((record, None));
                }
            }
        }

        self.check_cardinality(staged.len())?;
        let at = state.next_timestamp(self.clock());
        let mut events = Vec::with_capacity(staged.len());
        let mut ids = Vec::with_capacity(staged.len());
        for (record, previous) in staged {
            let event = match previous {
                Some(old) => ChangeEvent::new(ChangeKind::Update, self.table, record.to_row(), at)
                    .with_old_record(old.to_row()),
                None => ChangeEvent::new(ChangeKind::Insert, self.table, record.to_row(), at),
            };
            events.push(event);
            ids.push(record.id().to_string());
            state.table_mut(self.table).put(record);
        }

        let rows = self.render_ids(state, spec, &ids)?;
        Ok((rows, events))
    }

    fn run_update(
        &self,
        state: &mut DatabaseState,
        spec: &SelectSpec,
        patch: &Value,
    ) -> Result<Staged, DbError> {
        let Value::Object(patch) = patch else {
            return Err(DbError::Malformed(
                "update payload must be an object".to_string(),
            ));
        };
        let targets = self.partition_targets(state)?;
        self.check_cardinality(targets.len())?;

        let mut staged = Vec::with_capacity(targets.len());
        for old in targets {
            let mut row = old.to_row();
            merge_patch(self.table, &mut row, patch)?;
            row.insert(
                "updated_at".into(),
                json!(state.next_timestamp(self.clock())),
            );
            let record = self.validate(state, &row)?;
            staged.push((record, old));
        }

        let at = state.next_timestamp(self.clock());
        let mut events = Vec::with_capacity(staged.len());
        let mut ids = Vec::with_capacity(staged.len());
        for (record, old) in staged {
            events.push(
                ChangeEvent::new(ChangeKind::Update, self.table, record.to_row(), at)
                    .with_old_record(old.to_row()),
            );
            ids.push(record.id().to_string());
            state.table_mut(self.table).put(record);
        }

        let rows = self.render_ids(state, spec, &ids)?;
        Ok((rows, events))
    }

    fn run_delete(&self, state: &mut DatabaseState, spec: &SelectSpec) -> Result<Staged, DbError> {
        let targets = self.partition_targets(state)?;
        self.check_cardinality(targets.len())?;

        let mut rows = Vec::with_capacity(targets.len());
        for record in &targets {
            rows.push(spec.render(state, record, &self.auth)?);
        }

        let at = state.next_timestamp(self.clock());
        let mut events = Vec::new();
        for record in targets {
            if let Some(removed) = state.table_mut(self.table).remove(record.id()) {
                events.push(ChangeEvent::new(
                    ChangeKind::Delete,
                    self.table,
                    removed.to_row(),
                    at,
                ));
                apply_referential_actions(state, self.clock(), self.table, removed.id(), &mut events);
            }
        }
        Ok((rows, events))
    }

    fn render_ids(
        &self,
        state: &DatabaseState,
        spec: &SelectSpec,
        ids: &[String],
    ) -> Result<Vec<Row>, DbError> {
        ids.iter()
            .filter_map(|id| state.get(self.table, id))
            .map(|record| spec.render(state, record, &self.auth))
            .collect()
    }

    /// Fills or checks the owner column against the caller.
    fn apply_owner(&self, row: &mut Row) -> Result<(), DbError> {
        let Some(column) = self.table.owner_column() else {
            return Ok(());
        };
        if self.auth.bypasses_rls() {
            return Ok(());
        }
        let Some(user_id) = self.auth.user_id() else {
            return Err(DbError::RowLevelSecurity { table: self.table });
        };
        match row.get(column) {
            None | Some(Value::Null) => {
                row.insert(column.to_string(), Value::String(user_id.to_string()));
                Ok(())
            }
            Some(value) if value.as_str() == Some(user_id) => Ok(()),
            Some(_) => Err(DbError::RowLevelSecurity { table: self.table }),
        }
    }

    /// Validates a complete row: typed decode, unknown columns and foreign keys.
    fn validate(&self, state: &DatabaseState, row: &Row) -> Result<Record, DbError> {
        let record = self.table.parse_row(row)?;
        let known = record.to_row();
        if let Some(column) = row.keys().find(|column| !known.contains_key(*column)) {
            return Err(DbError::UnknownColumn {
                table: self.table,
                column: column.clone(),
            });
        }
        for relation in self.table.relations() {
            if relation.kind != RelationKind::BelongsTo {
                continue;
            }
            if let Some(Value::String(target_id)) = known.get(relation.foreign_key) {
                if state.get(relation.target, target_id).is_none() {
                    return Err(DbError::ForeignKey {
                        table: self.table,
                        column: relation.foreign_key.to_string(),
                    });
                }
            }
        }
        Ok(record)
    }
}

/// Applies `patch` over `row`, leaving immutable columns untouched.
fn merge_patch(table: Table, row: &mut Row, patch: &Row) -> Result<(), DbError> {
    let immutable = table.immutable_columns();
    for (column, value) in patch {
        if immutable.contains(&column.as_str()) {
            continue;
        }
        if !row.contains_key(column) {
            return Err(DbError::UnknownColumn {
                table,
                column: column.clone(),
            });
        }
        row.insert(column.clone(), value.clone());
    }
    Ok(())
}

/// Runs ON DELETE actions for rows referencing a removed parent.
fn apply_referential_actions(
    state: &mut DatabaseState,
    clock: &Clock,
    table: Table,
    parent_id: &str,
    events: &mut Vec<ChangeEvent>,
) {
    for relation in table.relations() {
        if relation.kind != RelationKind::HasMany || relation.on_delete == OnDelete::NoAction {
            continue;
        }
        let child_ids: Vec<String> = state
            .table(relation.target)
            .map(|data| {
                data.iter()
                    .filter(|child| references(child, relation.foreign_key, parent_id))
                    .map(|child| child.id().to_string())
                    .collect()
            })
            .unwrap_or_default();

        for child_id in child_ids {
            match relation.on_delete {
                OnDelete::Cascade => {
                    let Some(child) = state.table_mut(relation.target).remove(&child_id) else {
                        continue;
                    };
                    let at = state.next_timestamp(clock);
                    events.push(ChangeEvent::new(
                        ChangeKind::Delete,
                        relation.target,
                        child.to_row(),
                        at,
                    ));
                    apply_referential_actions(state, clock, relation.target, &child_id, events);
                }
                OnDelete::SetNull => {
                    let Some(old) = state.get(relation.target, &child_id).cloned() else {
                        continue;
                    };
                    let at = state.next_timestamp(clock);
                    let mut row = old.to_row();
                    row.insert(relation.foreign_key.to_string(), Value::Null);
                    row.insert("updated_at".into(), json!(at));
                    match relation.target.parse_row(&row) {
                        Ok(updated) => {
                            events.push(
                                ChangeEvent::new(ChangeKind::Update, relation.target, updated.to_row(), at)
                                    .with_old_record(old.to_row()),
                            );
                            state.table_mut(relation.target).put(updated);
                        }
                        Err(err) => {
                            warn!(stage = "storage", table = %relation.target, error = %err, "failed to null dangling reference");
                        }
                    }
                }
                OnDelete::NoAction => {}
            }
        }
    }
}

fn payload_rows(payload: &Value) -> Result<Vec<Row>, DbError> {
    match payload {
        Value::Object(row) => Ok(vec![row.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object().cloned().ok_or_else(|| {
                    DbError::Malformed("insert payload items must be objects".to_string())
                })
            })
            .collect(),
        _ => Err(DbError::Malformed(
            "insert payload must be an object or an array of objects".to_string(),
        )),
    }
}

/// Multi-key comparison; nulls sort last ascending and first descending.
fn compare_rows(left: &Row, right: &Row, orders: &[Order]) -> Ordering {
    for order in orders {
        let a = left.get(&order.column).unwrap_or(&Value::Null);
        let b = right.get(&order.column).unwrap_or(&Value::Null);
        let ordering = match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if order.ascending => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, true) if order.ascending => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => {
                let ordering = compare_values(a, b).unwrap_or(Ordering::Equal);
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn paginate<T>(items: Vec<T>, range: Option<(usize, usize)>, limit: Option<usize>) -> Vec<T> {
    let offset = range.map(|(from, _)| from).unwrap_or(0);
    let mut count = range.map(|(from, to)| to.saturating_sub(from).saturating_add(1));
    if let Some(limit) = limit {
        count = Some(count.map_or(limit, |count| count.min(limit)));
    }
    items
        .into_iter()
        .skip(offset)
        .take(count.unwrap_or(usize::MAX))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use applytrack_core::{ApplicationStatus, ChangeSink, NewApplication};

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl ChangeSink for RecordingSink {
        fn publish(&self, event: ChangeEvent) {
            self.events.lock().expect("sink").push(event);
        }
    }

    impl RecordingSink {
        fn kinds(&self) -> Vec<(ChangeKind, String)> {
            self.events
                .lock()
                .expect("sink")
                .iter()
                .map(|event| (event.event, event.table.clone()))
                .collect()
        }
    }

    fn setup() -> (MockDatabase, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let db = MockDatabase::new().with_sink(sink.clone());
        (db, sink)
    }

    fn alice() -> AuthContext {
        AuthContext::user("alice")
    }

    fn bob() -> AuthContext {
        AuthContext::user("bob")
    }

    async fn insert_application(db: &MockDatabase, auth: &AuthContext, company: &str) -> Row {
        let data = db
            .from(Table::Applications, auth)
            .insert(json!({
                "company_name": company,
                "job_title": "Engineer",
                "status": "applied",
            }))
            .single()
            .execute()
            .await
            .expect("insert succeeds");
        data.rows().pop().expect("one row")
    }

    #[tokio::test]
    async fn insert_assigns_unique_ids_and_equal_timestamps() {
        let (db, sink) = setup();
        let rows = db
            .from(Table::Applications, &alice())
            .insert(json!([
                { "company_name": "Acme", "job_title": "Engineer" },
                { "company_name": "Globex", "job_title": "Engineer" },
            ]))
            .execute()
            .await
            .expect("insert succeeds")
            .rows();

        assert_eq!(rows.len(), 2);
        assert_ne!(rows[0]["id"], rows[1]["id"]);
        for row in &rows {
            assert_eq!(row["created_at"], row["updated_at"]);
            assert_eq!(row["created_by"], "alice");
            assert_eq!(row["status"], "wishlist");
        }
        assert_eq!(
            sink.kinds(),
            vec![
                (ChangeKind::Insert, "applications".to_string()),
                (ChangeKind::Insert, "applications".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn insert_rejects_missing_required_fields() {
        let (db, sink) = setup();
        let err = db
            .from(Table::Applications, &alice())
            .insert(json!({ "company_name": "Acme" }))
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "23502");

        let err = db
            .from(Table::Companies, &alice())
            .insert(json!({ "industry": "Widgets" }))
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "23502");
        assert_eq!(db.count(Table::Applications), 0);
        assert!(sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn insert_rejects_foreign_owner_and_anonymous_caller() {
        let (db, _) = setup();
        let err = db
            .from(Table::Applications, &alice())
            .insert(json!({ "company_name": "Acme", "job_title": "Engineer", "created_by": "bob" }))
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err, DbError::RowLevelSecurity { table: Table::Applications });

        let err = db
            .from(Table::Applications, &AuthContext::Anonymous)
            .insert(json!({ "company_name": "Acme", "job_title": "Engineer" }))
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "42501");
    }

    #[tokio::test]
    async fn insert_rejects_duplicates_unknown_columns_and_dangling_keys() {
        let (db, _) = setup();
        let row = insert_application(&db, &alice(), "Acme").await;
        let err = db
            .from(Table::Applications, &alice())
            .insert(json!({ "id": row["id"], "company_name": "Acme", "job_title": "Engineer" }))
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "23505");

        let err = db
            .from(Table::Applications, &alice())
            .insert(json!({ "company_name": "Acme", "job_title": "Engineer", "favourite": true }))
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "42703");

        let err = db
            .from(Table::ApplicationActivities, &alice())
            .insert(json!({ "application_id": "missing", "activity_type": "note_added" }))
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "23503");
    }

    #[tokio::test]
    async fn typed_insert_payload_is_accepted() {
        let (db, _) = setup();
        let data = db
            .from(Table::Applications, &alice())
            .insert_record(&NewApplication::new("Acme", "Engineer").with_status(ApplicationStatus::Offered))
            .single()
            .execute()
            .await
            .expect("insert");
        let apps: Vec<applytrack_core::Application> = data.decode().expect("decode");
        assert_eq!(apps[0].status, ApplicationStatus::Offered);
        assert_eq!(apps[0].created_by, "alice");
    }

    #[tokio::test]
    async fn owner_scoped_select() {
        let (db, _) = setup();
        let row = insert_application(&db, &alice(), "Acme").await;

        let rows = db
            .from(Table::Applications, &alice())
            .select("*")
            .eq("created_by", "alice")
            .execute()
            .await
            .expect("select")
            .rows();
        assert_eq!(rows, vec![row]);

        let rows = db
            .from(Table::Applications, &bob())
            .eq("created_by", "alice")
            .execute()
            .await
            .expect("select")
            .rows();
        assert!(rows.is_empty());

        let rows = db
            .from(Table::Applications, &AuthContext::Service)
            .execute()
            .await
            .expect("select")
            .rows();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn update_merges_fields_and_advances_timestamp() {
        let (db, sink) = setup();
        let row = insert_application(&db, &alice(), "Acme").await;

        let updated = db
            .from(Table::Applications, &alice())
            .update(json!({ "status": "interviewing" }))
            .eq("id", row["id"].clone())
            .single()
            .execute()
            .await
            .expect("update")
            .rows()
            .pop()
            .expect("row");

        assert_eq!(updated["status"], "interviewing");
        assert_eq!(updated["company_name"], row["company_name"]);
        assert_eq!(updated["created_at"], row["created_at"]);
        assert_eq!(
            compare_values(&updated["updated_at"], &row["updated_at"]),
            Some(Ordering::Greater)
        );

        let events = sink.events.lock().expect("sink").clone();
        let update = events.last().expect("update event");
        assert_eq!(update.event, ChangeKind::Update);
        assert_eq!(update.payload["status"], "interviewing");
        assert_eq!(
            update.old_record.as_ref().expect("old record")["status"],
            "applied"
        );
    }

    #[tokio::test]
    async fn update_ignores_immutable_columns_and_validates() {
        let (db, _) = setup();
        let row = insert_application(&db, &alice(), "Acme").await;

        let updated = db
            .from(Table::Applications, &alice())
            .update(json!({ "created_by": "bob", "id": "other", "notes": "call back" }))
            .eq("id", row["id"].clone())
            .single()
            .execute()
            .await
            .expect("update")
            .rows()
            .pop()
            .expect("row");
        assert_eq!(updated["id"], row["id"]);
        assert_eq!(updated["created_by"], "alice");
        assert_eq!(updated["notes"], "call back");

        let err = db
            .from(Table::Applications, &alice())
            .update(json!({ "status": "on_hold" }))
            .eq("id", row["id"].clone())
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "22P02");
    }

    #[tokio::test]
    async fn unauthorized_update_is_skipped_by_default() {
        let (db, sink) = setup();
        let row = insert_application(&db, &alice(), "Acme").await;
        let before = sink.kinds().len();

        let data = db
            .from(Table::Applications, &bob())
            .update(json!({ "status": "rejected" }))
            .eq("id", row["id"].clone())
            .execute()
            .await
            .expect("skip is not an error");
        assert!(data.is_empty());
        assert_eq!(sink.kinds().len(), before);

        let err = db
            .from(Table::Applications, &bob())
            .delete()
            .eq("id", row["id"].clone())
            .single()
            .execute()
            .await
            .unwrap_err();
        assert!(err.is_no_rows());
        assert_eq!(db.count(Table::Applications), 1);
    }

    #[tokio::test]
    async fn unauthorized_mutation_is_rejected_in_strict_mode() {
        let (db, _) = setup();
        let db = db.with_rls_violation(RlsViolation::Reject);
        let row = insert_application(&db, &alice(), "Acme").await;

        let err = db
            .from(Table::Applications, &bob())
            .update(json!({ "status": "rejected" }))
            .eq("id", row["id"].clone())
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "42501");

        let err = db
            .from(Table::Applications, &bob())
            .delete()
            .eq("id", row["id"].clone())
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "42501");

        let rows = db
            .from(Table::Applications, &alice())
            .execute()
            .await
            .expect("select")
            .rows();
        assert_eq!(rows[0]["status"], "applied");
    }

    #[tokio::test]
    async fn delete_cascades_to_activities_only() {
        let (db, sink) = setup();
        let keep = insert_application(&db, &alice(), "Globex").await;
        let doomed = insert_application(&db, &alice(), "Acme").await;
        let company = db
            .from(Table::Companies, &alice())
            .insert(json!({ "name": "Acme" }))
            .execute()
            .await
            .expect("company");
        for (app, kind) in [(&doomed, "note_added"), (&doomed, "status_change"), (&keep, "note_added")] {
            db.from(Table::ApplicationActivities, &alice())
                .insert(json!({ "application_id": app["id"], "activity_type": kind }))
                .execute()
                .await
                .expect("activity");
        }
        let before = sink.kinds().len();

        let removed = db
            .from(Table::Applications, &alice())
            .delete()
            .eq("id", doomed["id"].clone())
            .execute()
            .await
            .expect("delete")
            .rows();
        assert_eq!(removed.len(), 1);
        assert_eq!(db.count(Table::Applications), 1);
        assert_eq!(db.count(Table::ApplicationActivities), 1);
        assert_eq!(db.count(Table::Companies), company.len());

        let kinds = sink.kinds()[before..].to_vec();
        assert_eq!(
            kinds,
            vec![
                (ChangeKind::Delete, "applications".to_string()),
                (ChangeKind::Delete, "application_activities".to_string()),
                (ChangeKind::Delete, "application_activities".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn deleting_company_nulls_references() {
        let (db, _) = setup();
        let company = db
            .from(Table::Companies, &alice())
            .insert(json!({ "name": "Acme" }))
            .single()
            .execute()
            .await
            .expect("company")
            .rows()
            .pop()
            .expect("row");
        let app = db
            .from(Table::Applications, &alice())
            .insert(json!({ "company_name": "Acme", "job_title": "Engineer", "company_id": company["id"] }))
            .single()
            .execute()
            .await
            .expect("app")
            .rows()
            .pop()
            .expect("row");

        db.from(Table::Companies, &alice())
            .delete()
            .eq("id", company["id"].clone())
            .execute()
            .await
            .expect("delete");

        let rows = db
            .from(Table::Applications, &alice())
            .eq("id", app["id"].clone())
            .execute()
            .await
            .expect("select")
            .rows();
        assert_eq!(rows[0]["company_id"], Value::Null);
    }

    #[tokio::test]
    async fn range_paginates_fifteen_rows() {
        let (db, _) = setup();
        let batch: Vec<Value> = (0..15)
            .map(|idx| json!({ "company_name": format!("Company {idx:02}"), "job_title": "Engineer" }))
            .collect();
        db.from(Table::Applications, &alice())
            .insert(Value::Array(batch[..8].to_vec()))
            .execute()
            .await
            .expect("first batch");
        db.from(Table::Applications, &alice())
            .insert(Value::Array(batch[8..].to_vec()))
            .execute()
            .await
            .expect("second batch");

        let first = db
            .from(Table::Applications, &alice())
            .order("company_name", true)
            .range(0, 9)
            .execute()
            .await
            .expect("page 1")
            .rows();
        let second = db
            .from(Table::Applications, &alice())
            .order("company_name", true)
            .range(10, 19)
            .execute()
            .await
            .expect("page 2")
            .rows();
        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 5);
        assert_eq!(first[0]["company_name"], "Company 00");
        assert_eq!(second[4]["company_name"], "Company 14");
    }

    #[tokio::test]
    async fn open_ended_range_returns_remaining_rows() {
        let (db, _) = setup();
        let batch: Vec<Value> = (0..3)
            .map(|idx| json!({ "company_name": format!("Company {idx}"), "job_title": "Engineer" }))
            .collect();
        db.from(Table::Applications, &alice())
            .insert(Value::Array(batch))
            .execute()
            .await
            .expect("insert");

        let all = db
            .from(Table::Applications, &alice())
            .range(0, usize::MAX)
            .execute()
            .await
            .expect("open range");
        assert_eq!(all.len(), 3);

        let tail = db
            .from(Table::Applications, &alice())
            .order("company_name", true)
            .range(1, usize::MAX)
            .execute()
            .await
            .expect("tail")
            .rows();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0]["company_name"], "Company 1");
    }

    #[tokio::test]
    async fn filters_order_and_limit_compose() {
        let (db, _) = setup();
        for (company, status, location) in [
            ("Acme", "applied", Some("Remote")),
            ("Globex", "interviewing", None),
            ("Initech", "rejected", Some("Berlin")),
            ("Umbrella", "ghosted", Some("Remote")),
        ] {
            db.from(Table::Applications, &alice())
                .insert(json!({ "company_name": company, "job_title": "Engineer", "status": status, "location": location }))
                .execute()
                .await
                .expect("insert");
        }

        let names = |rows: Vec<Row>| -> Vec<String> {
            rows.iter()
                .map(|row| row["company_name"].as_str().unwrap_or_default().to_string())
                .collect()
        };

        let rows = db
            .from(Table::Applications, &alice())
            .not("status", "in", "(rejected,ghosted)")
            .order("company_name", false)
            .execute()
            .await
            .expect("select")
            .rows();
        assert_eq!(names(rows), vec!["Globex", "Acme"]);

        let rows = db
            .from(Table::Applications, &alice())
            .or("location.eq.Berlin,company_name.ilike.%glob%")
            .order("company_name", true)
            .execute()
            .await
            .expect("select")
            .rows();
        assert_eq!(names(rows), vec!["Globex", "Initech"]);

        let rows = db
            .from(Table::Applications, &alice())
            .order("location", true)
            .order("company_name", true)
            .limit(3)
            .execute()
            .await
            .expect("select")
            .rows();
        assert_eq!(names(rows), vec!["Initech", "Acme", "Umbrella"]);

        let rows = db
            .from(Table::Applications, &alice())
            .in_("status", ["applied", "interviewing"])
            .gte("created_at", "2000-01-01T00:00:00Z")
            .execute()
            .await
            .expect("select")
            .rows();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn malformed_filters_degrade_to_no_filtering() {
        let (db, _) = setup();
        insert_application(&db, &alice(), "Acme").await;
        insert_application(&db, &alice(), "Globex").await;

        let rows = db
            .from(Table::Applications, &alice())
            .or("status.eq.applied,(broken")
            .not("status", "between", "1")
            .execute()
            .await
            .expect("select")
            .rows();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn single_reports_no_rows_and_multiple_rows() {
        let (db, _) = setup();
        let err = db
            .from(Table::Applications, &alice())
            .single()
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err, DbError::NoRows);

        let data = db
            .from(Table::Applications, &alice())
            .maybe_single()
            .execute()
            .await
            .expect("maybe single");
        assert_eq!(data, QueryData::Single(None));

        insert_application(&db, &alice(), "Acme").await;
        insert_application(&db, &alice(), "Globex").await;
        let err = db
            .from(Table::Applications, &alice())
            .single()
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err, DbError::MultipleRows(2));

        let err = db
            .from(Table::Applications, &alice())
            .update(json!({ "notes": "bulk" }))
            .single()
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err, DbError::MultipleRows(2));
        let rows = db
            .from(Table::Applications, &alice())
            .is("notes", Value::Null)
            .execute()
            .await
            .expect("select")
            .rows();
        assert_eq!(rows.len(), 2, "rejected single() update must not write");
    }

    #[tokio::test]
    async fn select_embeds_declared_relations() {
        let (db, _) = setup();
        let app = insert_application(&db, &alice(), "Acme").await;
        db.from(Table::ApplicationActivities, &alice())
            .insert(json!({ "application_id": app["id"], "activity_type": "note_added", "description": "sent" }))
            .execute()
            .await
            .expect("activity");

        let row = db
            .from(Table::Applications, &alice())
            .select("id, company_name, activities:application_activities(activity_type, description), companies(*)")
            .single()
            .execute()
            .await
            .expect("select")
            .rows()
            .pop()
            .expect("row");
        assert_eq!(row.len(), 4);
        assert_eq!(
            row["activities"],
            json!([{ "activity_type": "note_added", "description": "sent" }])
        );
        assert_eq!(row["companies"], Value::Null);

        let err = db
            .from(Table::Applications, &alice())
            .select("*, jobs(*)")
            .execute()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PGRST200");
    }

    #[tokio::test]
    async fn upsert_updates_existing_rows() {
        let (db, sink) = setup();
        let row = insert_application(&db, &alice(), "Acme").await;
        let rows = db
            .from(Table::Applications, &alice())
            .upsert(json!([
                { "id": row["id"], "company_name": "Acme", "job_title": "Staff Engineer" },
                { "company_name": "Globex", "job_title": "Engineer" },
            ]))
            .execute()
            .await
            .expect("upsert")
            .rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["job_title"], "Staff Engineer");
        assert_eq!(rows[0]["created_at"], row["created_at"]);
        assert_eq!(db.count(Table::Applications), 2);
        let kinds: Vec<ChangeKind> = sink.kinds().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Insert]
        );
    }

    #[tokio::test]
    async fn malformed_payloads_and_ranges_are_errors() {
        let (db, _) = setup();
        let err = db
            .from(Table::Applications, &alice())
            .insert(json!("nope"))
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Malformed(_)));

        let err = db
            .from(Table::Applications, &alice())
            .range(5, 2)
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Malformed(_)));

        let response = db
            .from(Table::Applications, &alice())
            .update(json!([1, 2]))
            .respond()
            .await;
        assert_eq!(response.data, Value::Null);
        assert_eq!(response.error.expect("error").code, "PGRST100");
    }

    #[tokio::test]
    async fn simulated_latency_delays_resolution() {
        let (db, _) = setup();
        let db = db.with_latency(std::time::Duration::from_millis(20));
        let started = std::time::Instant::now();
        db.from(Table::Companies, &alice())
            .execute()
            .await
            .expect("select");
        assert!(started.elapsed() >= std::time::Duration::from_millis(20));
    }
}
