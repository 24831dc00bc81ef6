//! Views: filtered, sorted projections of a table.
//!
//! A view keeps a materialized copy of its result, recomputed by the owning
//! table on every flush of a non-empty port. Reads never touch the table.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TableError;
use crate::table::callback::{CallbackKind, CallbackRegistration, CallbackRegistry, ClientId};
use crate::table::codec::ColumnarCodec;
use crate::table::{compare_values, values_equal, Row, Schema};

/// Comparison operator of a filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    /// Equal.
    #[serde(rename = "==")]
    Eq,
    /// Not equal.
    #[serde(rename = "!=")]
    Ne,
    /// Less than.
    #[serde(rename = "<")]
    Lt,
    /// Less than or equal.
    #[serde(rename = "<=")]
    Le,
    /// Greater than.
    #[serde(rename = ">")]
    Gt,
    /// Greater than or equal.
    #[serde(rename = ">=")]
    Ge,
    /// Substring match on strings.
    #[serde(rename = "contains")]
    Contains,
    /// Value is null.
    #[serde(rename = "is null")]
    IsNull,
    /// Value is not null.
    #[serde(rename = "is not null")]
    IsNotNull,
}

impl FilterOp {
    fn takes_operand(&self) -> bool {
        !matches!(self, FilterOp::IsNull | FilterOp::IsNotNull)
    }
}

/// One `[column, op, value]` filter clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct Filter {
    /// Column tested.
    pub column: String,
    /// Operator.
    pub op: FilterOp,
    /// Operand; `Null` for the null tests.
    pub value: Value,
}

impl Filter {
    /// Build a filter clause.
    pub fn new(column: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    /// Whether a row passes this clause.
    pub fn matches(&self, row: &Row) -> bool {
        let cell = row.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::IsNull => cell.is_null(),
            FilterOp::IsNotNull => !cell.is_null(),
            _ if cell.is_null() => false,
            FilterOp::Eq => values_equal(cell, &self.value),
            FilterOp::Ne => !values_equal(cell, &self.value),
            FilterOp::Lt => compare_values(cell, &self.value) == Ordering::Less,
            FilterOp::Le => compare_values(cell, &self.value) != Ordering::Greater,
            FilterOp::Gt => compare_values(cell, &self.value) == Ordering::Greater,
            FilterOp::Ge => compare_values(cell, &self.value) != Ordering::Less,
            FilterOp::Contains => match (cell.as_str(), self.value.as_str()) {
                (Some(haystack), Some(needle)) => haystack.contains(needle),
                _ => false,
            },
        }
    }
}

impl TryFrom<Vec<Value>> for Filter {
    type Error = String;

    fn try_from(parts: Vec<Value>) -> Result<Self, Self::Error> {
        let mut parts = parts.into_iter();
        let column = match parts.next() {
            Some(Value::String(column)) => column,
            _ => return Err("filter must start with a column name".to_string()),
        };
        let op: FilterOp = match parts.next() {
            Some(op) => serde_json::from_value(op).map_err(|e| format!("filter operator: {e}"))?,
            None => return Err(format!("filter on '{column}' has no operator")),
        };
        let value = parts.next().unwrap_or(Value::Null);
        if op.takes_operand() && value.is_null() {
            return Err(format!("filter on '{column}' needs an operand"));
        }
        if parts.next().is_some() {
            return Err(format!("filter on '{column}' has too many parts"));
        }
        Ok(Filter { column, op, value })
    }
}

impl From<Filter> for Vec<Value> {
    fn from(filter: Filter) -> Self {
        let op = serde_json::to_value(filter.op).unwrap_or(Value::Null);
        let mut parts = vec![Value::String(filter.column), op];
        if filter.op.takes_operand() {
            parts.push(filter.value);
        }
        parts
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// One `[column, "asc"|"desc"]` sort clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort(pub String, pub SortOrder);

/// Query configuration of a view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Projected columns; every schema column when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    /// Row filters, all of which must pass.
    pub filter: Vec<Filter>,
    /// Sort keys, most significant first.
    pub sort: Vec<Sort>,
    /// Row pivots. Not supported by the reference engine.
    pub group_by: Vec<String>,
    /// Column pivots. Not supported by the reference engine.
    pub split_by: Vec<String>,
}

impl ViewConfig {
    /// Project onto the given columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Add a filter clause.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter.push(filter);
        self
    }

    /// Add a sort key.
    pub fn with_sort(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push(Sort(column.into(), order));
        self
    }

    /// Check the configuration against a table schema and resolve the
    /// projected column list.
    pub(crate) fn resolve_columns(&self, schema: &Schema) -> Result<Vec<String>, TableError> {
        if !self.group_by.is_empty() {
            return Err(TableError::Unsupported("group_by".to_string()));
        }
        if !self.split_by.is_empty() {
            return Err(TableError::Unsupported("split_by".to_string()));
        }
        let referenced = self
            .filter
            .iter()
            .map(|f| &f.column)
            .chain(self.sort.iter().map(|s| &s.0));
        for column in referenced {
            if !schema.contains(column) {
                return Err(TableError::UnknownColumn(column.clone()));
            }
        }
        match &self.columns {
            Some(columns) => {
                for column in columns {
                    if !schema.contains(column) {
                        return Err(TableError::UnknownColumn(column.clone()));
                    }
                }
                Ok(columns.clone())
            }
            None => Ok(schema.column_names()),
        }
    }

    fn sort_rows(&self, rows: &mut [Row]) {
        if self.sort.is_empty() {
            return;
        }
        rows.sort_by(|a, b| {
            for Sort(column, order) in &self.sort {
                let left = a.get(column).unwrap_or(&Value::Null);
                let right = b.get(column).unwrap_or(&Value::Null);
                let ordering = match order {
                    SortOrder::Asc => compare_values(left, right),
                    SortOrder::Desc => compare_values(right, left),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }
}

/// Row window for `to_records` / `to_columns` / `to_arrow`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Window {
    /// First row, inclusive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_row: Option<usize>,
    /// Last row, exclusive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_row: Option<usize>,
}

impl Window {
    /// Rows `start..end`.
    pub fn rows(start: usize, end: usize) -> Self {
        Self {
            start_row: Some(start),
            end_row: Some(end),
        }
    }

    fn slice<'a>(&self, rows: &'a [Row]) -> &'a [Row] {
        let end = self.end_row.unwrap_or(rows.len()).min(rows.len());
        let start = self.start_row.unwrap_or(0).min(end);
        &rows[start..end]
    }
}

struct ViewState {
    rows: Vec<Row>,
    callbacks: CallbackRegistry,
    deleted: bool,
}

/// A derived, queryable projection of one table.
pub struct View {
    name: String,
    table_name: String,
    config: ViewConfig,
    columns: Vec<String>,
    schema: Schema,
    client_id: Option<ClientId>,
    codec: Arc<dyn ColumnarCodec>,
    state: Mutex<ViewState>,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("name", &self.name)
            .field("table_name", &self.table_name)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl View {
    pub(crate) fn new(
        name: String,
        table_name: String,
        config: ViewConfig,
        table_schema: &Schema,
        client_id: Option<ClientId>,
        codec: Arc<dyn ColumnarCodec>,
        source_rows: &[Row],
    ) -> Result<Self, TableError> {
        let columns = config.resolve_columns(table_schema)?;
        let schema = table_schema.project(&columns);
        let view = Self {
            name,
            table_name,
            config,
            columns,
            schema,
            client_id,
            codec,
            state: Mutex::new(ViewState {
                rows: Vec::new(),
                callbacks: CallbackRegistry::new(),
                deleted: false,
            }),
        };
        view.refresh(source_rows);
        Ok(view)
    }

    /// View name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the source table.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Owning session, `None` for host-created views.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// Query configuration.
    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    /// Schema of the projected columns.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Projected column names, in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows in the materialized result.
    pub fn num_rows(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// Number of projected columns.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Whether the view has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// Rows as JSON objects.
    pub fn to_records(&self, window: Window) -> Vec<Row> {
        let state = self.state.lock();
        window
            .slice(&state.rows)
            .iter()
            .map(|row| self.project(row))
            .collect()
    }

    /// Rows as a `{column: [values]}` map.
    pub fn to_columns(&self, window: Window) -> Map<String, Value> {
        let state = self.state.lock();
        let rows = window.slice(&state.rows);
        self.columns
            .iter()
            .map(|column| {
                let values = rows
                    .iter()
                    .map(|row| row.get(column).cloned().unwrap_or(Value::Null))
                    .collect();
                (column.clone(), Value::Array(values))
            })
            .collect()
    }

    /// Rows encoded with the server's columnar codec.
    ///
    /// # Errors
    ///
    /// Returns the codec's error if the rows cannot be encoded.
    pub fn to_binary(&self, window: Window) -> Result<Bytes, TableError> {
        let state = self.state.lock();
        self.codec.encode(&self.columns, window.slice(&state.rows))
    }

    /// Attach a subscriber.
    pub fn register(&self, registration: CallbackRegistration) {
        self.state.lock().callbacks.register(registration);
    }

    /// Detach the owner's subscriber with this id and class.
    pub fn remove_callback(
        &self,
        client_id: Option<ClientId>,
        callback_id: i64,
        kind: CallbackKind,
    ) -> bool {
        self.state
            .lock()
            .callbacks
            .remove(client_id, callback_id, kind)
    }

    /// Detach every subscriber of the owner with this id.
    pub fn remove_callback_id(&self, client_id: Option<ClientId>, callback_id: i64) -> usize {
        self.state.lock().callbacks.remove_id(client_id, callback_id)
    }

    /// Number of attached subscribers.
    pub fn callback_count(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    fn project(&self, row: &Row) -> Row {
        self.columns
            .iter()
            .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    fn select(&self, rows: &[Row]) -> Vec<Row> {
        let mut selected: Vec<Row> = rows
            .iter()
            .filter(|row| self.config.filter.iter().all(|f| f.matches(row)))
            .cloned()
            .collect();
        self.config.sort_rows(&mut selected);
        selected
    }

    /// Recompute the materialized result from the table's rows.
    pub(crate) fn refresh(&self, source_rows: &[Row]) {
        let rows = self.select(source_rows);
        self.state.lock().rows = rows;
    }

    /// Notify update subscribers of one flushed port. `touched` holds the
    /// rows written by that port's batch.
    pub(crate) fn notify_update(&self, port_id: u32, touched: &[Row]) -> usize {
        let mut state = self.state.lock();
        if state.deleted || state.callbacks.is_empty() {
            return 0;
        }
        let delta = if state.callbacks.wants_rows() {
            let rows = self.select(touched);
            match self.codec.encode(&self.columns, &rows) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!(view = %self.name, error = %e, "failed to encode row delta");
                    None
                }
            }
        } else {
            None
        };
        state.callbacks.notify_update(&self.name, port_id, delta.as_ref())
    }

    /// Mark deleted and notify delete subscribers. Idempotent.
    pub(crate) fn mark_deleted(&self) -> usize {
        let mut state = self.state.lock();
        if state.deleted {
            return 0;
        }
        state.deleted = true;
        state.rows.clear();
        state.callbacks.notify_delete(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::callback::{Notification, Sink, UpdateMode};
    use crate::table::codec::JsonColumnarCodec;
    use crate::table::ColumnType;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object")
    }

    fn schema() -> Schema {
        Schema::new(vec![
            ("id".to_string(), ColumnType::Integer),
            ("name".to_string(), ColumnType::String),
            ("score".to_string(), ColumnType::Float),
        ])
    }

    fn rows() -> Vec<Row> {
        vec![
            row(json!({"id": 1, "name": "alpha", "score": 2.5})),
            row(json!({"id": 2, "name": "beta", "score": null})),
            row(json!({"id": 3, "name": "gamma", "score": 9.0})),
        ]
    }

    fn view(config: ViewConfig) -> View {
        View::new(
            "v".to_string(),
            "t".to_string(),
            config,
            &schema(),
            None,
            Arc::new(JsonColumnarCodec),
            &rows(),
        )
        .expect("view")
    }

    #[test]
    fn test_filter_parse() {
        let filter: Filter = serde_json::from_value(json!(["score", ">", 3])).expect("parse");
        assert_eq!(filter, Filter::new("score", FilterOp::Gt, json!(3)));

        let filter: Filter = serde_json::from_value(json!(["score", "is null"])).expect("parse");
        assert_eq!(filter.op, FilterOp::IsNull);
        assert_eq!(serde_json::to_value(&filter).expect("ser"), json!(["score", "is null"]));

        assert!(serde_json::from_value::<Filter>(json!(["score", "~", 1])).is_err());
        assert!(serde_json::from_value::<Filter>(json!(["score", "=="])).is_err());
    }

    #[test]
    fn test_filter_and_sort() {
        let v = view(
            ViewConfig::default()
                .with_filter(Filter::new("score", FilterOp::IsNotNull, Value::Null))
                .with_sort("score", SortOrder::Desc),
        );
        let records = v.to_records(Window::default());
        let ids: Vec<_> = records.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(3), json!(1)]);
    }

    #[test]
    fn test_contains_filter() {
        let v = view(ViewConfig::default().with_filter(Filter::new(
            "name",
            FilterOp::Contains,
            json!("ta"),
        )));
        assert_eq!(v.num_rows(), 1);
    }

    #[test]
    fn test_projection_and_window() {
        let v = view(ViewConfig::default().with_columns(["name"]));
        assert_eq!(v.num_columns(), 1);
        assert_eq!(
            v.to_records(Window::rows(1, 2)),
            vec![row(json!({"name": "beta"}))]
        );
        assert_eq!(
            Value::Object(v.to_columns(Window::rows(2, 100))),
            json!({"name": ["gamma"]})
        );
    }

    #[test]
    fn test_unknown_column_rejected() {
        let result = View::new(
            "v".to_string(),
            "t".to_string(),
            ViewConfig::default().with_sort("missing", SortOrder::Asc),
            &schema(),
            None,
            Arc::new(JsonColumnarCodec),
            &[],
        );
        assert_eq!(
            result.map(|_| ()),
            Err(TableError::UnknownColumn("missing".to_string()))
        );
    }

    #[test]
    fn test_group_by_unsupported() {
        let config = ViewConfig {
            group_by: vec!["name".to_string()],
            ..ViewConfig::default()
        };
        assert!(matches!(
            config.resolve_columns(&schema()),
            Err(TableError::Unsupported(_))
        ));
    }

    #[test]
    fn test_row_delta_is_filtered_by_view() {
        let v = view(ViewConfig::default().with_filter(Filter::new(
            "id",
            FilterOp::Ge,
            json!(2),
        )));
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        v.register(CallbackRegistration::new(
            4,
            CallbackKind::Update(UpdateMode::Row),
            None,
            Sink::Channel(tx),
        ));

        let touched = vec![
            row(json!({"id": 1, "name": "x", "score": 1.0})),
            row(json!({"id": 5, "name": "y", "score": 1.0})),
        ];
        assert_eq!(v.notify_update(0, &touched), 1);

        let n = rx.try_recv().expect("notification");
        let delta: Value = serde_json::from_slice(&n.delta.expect("delta")).expect("json");
        assert_eq!(delta["id"], json!([5]));
    }

    #[test]
    fn test_mark_deleted_is_idempotent() {
        let v = view(ViewConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        v.register(CallbackRegistration::new(1, CallbackKind::Delete, None, Sink::Channel(tx)));

        assert_eq!(v.mark_deleted(), 1);
        assert_eq!(v.mark_deleted(), 0);
        assert!(v.is_deleted());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
