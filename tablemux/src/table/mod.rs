//! Reference table engine.
//!
//! Tables are shared and server-wide. Writes are queued on a [`Port`] and
//! only become visible to views when [`Table::flush`] runs:
//!
//! ```text
//!   update(data, port 2) ─┐
//!   update(data, port 0) ─┼─► ports[k].pending ──flush──► rows ──► views ──► callbacks
//!   remove(keys, port 2) ─┘      (ascending k)
//! ```
//!
//! Each flushed port with a non-empty batch yields exactly one round of
//! update notifications tagged with that port's id. Ports with nothing
//! queued stay silent.
//!
//! All table state (rows, ports, views, delete subscribers) sits behind one
//! lock, so `update`, `make_port` and `flush` are mutually exclusive.

pub mod callback;
pub mod codec;
pub mod view;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TableError;
use callback::{CallbackKind, CallbackRegistration, CallbackRegistry, ClientId};
use codec::{ColumnarCodec, JsonColumnarCodec};
use view::{View, ViewConfig};

/// A row keyed by column name.
pub type Row = Map<String, Value>;

/// Port every table starts with.
pub const DEFAULT_PORT: u32 = 0;

/// Type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// 64-bit integer.
    Integer,
    /// Floating point.
    Float,
    /// UTF-8 string.
    String,
    /// Boolean.
    Boolean,
    /// Calendar date, carried as a string.
    Date,
    /// Timestamp, carried as a string or epoch milliseconds.
    Datetime,
}

impl ColumnType {
    /// Whether `value` may be stored in a column of this type. Null always fits.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (ColumnType::Float, Value::Number(_)) => true,
            (ColumnType::String | ColumnType::Date, Value::String(_)) => true,
            (ColumnType::Datetime, Value::String(_)) => true,
            (ColumnType::Datetime, Value::Number(n)) => n.is_i64(),
            (ColumnType::Boolean, Value::Bool(_)) => true,
            _ => false,
        }
    }

    /// Type of a column first seen holding `value`.
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(ColumnType::Integer),
            Value::Number(_) => Some(ColumnType::Float),
            Value::String(_) => Some(ColumnType::String),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::String => "string",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Datetime => "datetime",
        };
        f.write_str(name)
    }
}

/// Ordered column name → type mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<(String, ColumnType)>,
}

impl Schema {
    /// Build from ordered columns.
    pub fn new(columns: Vec<(String, ColumnType)>) -> Self {
        Self { columns }
    }

    /// Type of a column.
    pub fn get(&self, column: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, ty)| *ty)
    }

    /// Whether the column exists.
    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Restrict to the given columns, in the given order.
    pub fn project(&self, columns: &[String]) -> Schema {
        Schema::new(
            columns
                .iter()
                .filter_map(|c| self.get(c).map(|ty| (c.clone(), ty)))
                .collect(),
        )
    }

    /// Wire form, `{"column": "type"}`.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.columns
                .iter()
                .map(|(name, ty)| (name.clone(), Value::String(ty.to_string())))
                .collect(),
        )
    }

    fn infer(rows: &[Row]) -> Schema {
        let mut columns: Vec<(String, Option<ColumnType>)> = Vec::new();
        for row in rows {
            for (name, value) in row {
                match columns.iter_mut().find(|(n, _)| n == name) {
                    Some((_, ty @ None)) => *ty = ColumnType::infer(value),
                    Some(_) => {}
                    None => columns.push((name.clone(), ColumnType::infer(value))),
                }
            }
        }
        Schema::new(
            columns
                .into_iter()
                .map(|(name, ty)| (name, ty.unwrap_or(ColumnType::String)))
                .collect(),
        )
    }

    fn validate(&self, row: &Row) -> Result<(), TableError> {
        for (column, value) in row {
            let ty = self
                .get(column)
                .ok_or_else(|| TableError::UnknownColumn(column.clone()))?;
            if !ty.accepts(value) {
                return Err(TableError::TypeMismatch {
                    column: column.clone(),
                    expected: ty.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Table input as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TableData {
    /// `[{"a": 1}, {"a": 2}]`
    Records(Vec<Row>),
    /// `{"a": [1, 2]}`
    Columns(BTreeMap<String, Vec<Value>>),
    /// `{"a": "integer"}`; creates an empty table.
    Schema(BTreeMap<String, ColumnType>),
}

impl TableData {
    /// Convert to rows.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if column arrays have different lengths.
    pub fn into_rows(self) -> Result<Vec<Row>, TableError> {
        match self {
            TableData::Records(rows) => Ok(rows),
            TableData::Schema(_) => Ok(Vec::new()),
            TableData::Columns(columns) => {
                let len = columns.values().next().map(Vec::len).unwrap_or(0);
                if columns.values().any(|values| values.len() != len) {
                    return Err(TableError::InvalidData(
                        "column arrays have different lengths".to_string(),
                    ));
                }
                let mut rows = vec![Row::new(); len];
                for (column, values) in columns {
                    for (row, value) in rows.iter_mut().zip(values) {
                        row.insert(column.clone(), value);
                    }
                }
                Ok(rows)
            }
        }
    }
}

/// Primary-key value of a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey(String);

impl RowKey {
    /// Key of an index value.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => RowKey(s.clone()),
            other => RowKey(other.to_string()),
        }
    }
}

/// Total order used by sort and range filters: null < bool < number < string.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

enum PendingOp {
    Upsert(Row),
    Remove(RowKey),
}

/// Uncommitted write batch of one port.
#[derive(Default)]
pub struct PortDelta {
    ops: Vec<PendingOp>,
}

impl PortDelta {
    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Input buffer on a table, flushed independently of the others.
pub struct Port {
    id: u32,
    pending: PortDelta,
}

impl Port {
    fn new(id: u32) -> Self {
        Self {
            id,
            pending: PortDelta::default(),
        }
    }

    /// Port id.
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// What one [`Table::flush`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Ports whose batch was applied, ascending.
    pub flushed_ports: Vec<u32>,
    /// Update notifications delivered across all views.
    pub notifications: usize,
}

struct TableState {
    rows: Vec<Row>,
    positions: HashMap<RowKey, usize>,
    ports: Vec<Port>,
    views: BTreeMap<String, Arc<View>>,
    delete_callbacks: CallbackRegistry,
    deleted: bool,
}

impl TableState {
    fn clear(&mut self) {
        self.rows.clear();
        self.positions.clear();
        for port in &mut self.ports {
            port.pending = PortDelta::default();
        }
        for view in self.views.values() {
            view.refresh(&[]);
        }
    }

    fn queue(&mut self, rows: Vec<Row>, port_id: u32) -> Result<(), TableError> {
        let port = self
            .ports
            .get_mut(port_id as usize)
            .ok_or(TableError::UnknownPort(port_id))?;
        port.pending
            .ops
            .extend(rows.into_iter().map(PendingOp::Upsert));
        Ok(())
    }

    fn rebuild_positions(&mut self, index: &str) {
        self.positions = self
            .rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| row.get(index).map(|v| (RowKey::from_value(v), i)))
            .collect();
    }

    /// Apply a batch; returns the rows it wrote, in their final state.
    fn apply(&mut self, delta: PortDelta, schema: &Schema, index: Option<&str>) -> Vec<Row> {
        let Some(index) = index else {
            let mut touched = Vec::new();
            for op in delta.ops {
                if let PendingOp::Upsert(row) = op {
                    let row = complete_row(row, schema);
                    touched.push(row.clone());
                    self.rows.push(row);
                }
            }
            return touched;
        };

        let mut touched_keys: Vec<RowKey> = Vec::new();
        for op in delta.ops {
            match op {
                PendingOp::Upsert(row) => {
                    let key = row.get(index).map(RowKey::from_value);
                    let Some(key) = key else { continue };
                    match self.positions.get(&key) {
                        Some(&pos) => {
                            let existing = &mut self.rows[pos];
                            for (column, value) in row {
                                existing.insert(column, value);
                            }
                        }
                        None => {
                            self.positions.insert(key.clone(), self.rows.len());
                            self.rows.push(complete_row(row, schema));
                        }
                    }
                    if !touched_keys.contains(&key) {
                        touched_keys.push(key);
                    }
                }
                PendingOp::Remove(key) => {
                    if let Some(pos) = self.positions.remove(&key) {
                        self.rows.remove(pos);
                        self.rebuild_positions(index);
                    }
                    touched_keys.retain(|k| k != &key);
                }
            }
        }
        touched_keys
            .iter()
            .filter_map(|key| self.positions.get(key).map(|&pos| self.rows[pos].clone()))
            .collect()
    }
}

fn complete_row(mut row: Row, schema: &Schema) -> Row {
    for (column, _) in &schema.columns {
        row.entry(column.clone()).or_insert(Value::Null);
    }
    row
}

/// A shared, named table.
pub struct Table {
    name: String,
    schema: Schema,
    index: Option<String>,
    codec: Arc<dyn ColumnarCodec>,
    state: Mutex<TableState>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Create a table from initial data, inferring the schema unless given.
    ///
    /// # Errors
    ///
    /// Fails if the index column is not in the schema or a row is invalid.
    pub fn new(
        name: impl Into<String>,
        data: TableData,
        index: Option<String>,
    ) -> Result<Self, TableError> {
        Self::with_codec(name, data, index, Arc::new(JsonColumnarCodec))
    }

    /// Like [`Table::new`], encoding binary output with `codec`.
    ///
    /// # Errors
    ///
    /// Fails if the index column is not in the schema or a row is invalid.
    pub fn with_codec(
        name: impl Into<String>,
        data: TableData,
        index: Option<String>,
        codec: Arc<dyn ColumnarCodec>,
    ) -> Result<Self, TableError> {
        let (schema, rows) = match data {
            TableData::Schema(columns) => (Schema::new(columns.into_iter().collect()), Vec::new()),
            other => {
                let rows = other.into_rows()?;
                (Schema::infer(&rows), rows)
            }
        };
        if let Some(index) = &index {
            if !schema.contains(index) {
                return Err(TableError::UnknownColumn(index.clone()));
            }
        }

        let table = Self {
            name: name.into(),
            schema,
            index,
            codec,
            state: Mutex::new(TableState {
                rows: Vec::new(),
                positions: HashMap::new(),
                ports: vec![Port::new(DEFAULT_PORT)],
                views: BTreeMap::new(),
                delete_callbacks: CallbackRegistry::new(),
                deleted: false,
            }),
        };
        if !rows.is_empty() {
            table.enqueue_rows(rows, DEFAULT_PORT)?;
            let mut state = table.state.lock();
            let delta = std::mem::take(&mut state.ports[DEFAULT_PORT as usize].pending);
            state.apply(delta, &table.schema, table.index.as_deref());
            drop(state);
        }
        Ok(table)
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Primary index column.
    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }

    /// Committed row count.
    pub fn size(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// Column names in schema order.
    pub fn columns(&self) -> Vec<String> {
        self.schema.column_names()
    }

    /// Allocate a new port.
    pub fn make_port(&self) -> u32 {
        let mut state = self.state.lock();
        let id = state.ports.len() as u32;
        state.ports.push(Port::new(id));
        tracing::debug!(table = %self.name, port_id = id, "allocated port");
        id
    }

    /// Number of allocated ports, including the default one.
    pub fn port_count(&self) -> usize {
        self.state.lock().ports.len()
    }

    /// Operations queued on a port and not yet flushed.
    pub fn pending(&self, port_id: u32) -> Option<usize> {
        self.state
            .lock()
            .ports
            .get(port_id as usize)
            .map(|p| p.pending.len())
    }

    /// Queue rows on a port. Visible after the next [`Table::flush`].
    ///
    /// # Errors
    ///
    /// Fails on an unknown port, an unknown column, a type mismatch or (for
    /// indexed tables) a row without an index value. Nothing is queued then.
    pub fn update(&self, data: TableData, port_id: u32) -> Result<(), TableError> {
        self.enqueue_rows(data.into_rows()?, port_id)
    }

    fn check_rows(&self, rows: &[Row]) -> Result<(), TableError> {
        for row in rows {
            self.schema.validate(row)?;
            if let Some(index) = &self.index {
                if row.get(index).map_or(true, Value::is_null) {
                    return Err(TableError::MissingIndexValue(index.clone()));
                }
            }
        }
        Ok(())
    }

    fn enqueue_rows(&self, rows: Vec<Row>, port_id: u32) -> Result<(), TableError> {
        self.check_rows(&rows)?;
        self.state.lock().queue(rows, port_id)
    }

    /// Queue removal of rows by primary key.
    ///
    /// # Errors
    ///
    /// Fails if the table has no index or the port is unknown.
    pub fn remove(&self, keys: &[Value], port_id: u32) -> Result<(), TableError> {
        if self.index.is_none() {
            return Err(TableError::NoIndex);
        }
        let mut state = self.state.lock();
        let port = state
            .ports
            .get_mut(port_id as usize)
            .ok_or(TableError::UnknownPort(port_id))?;
        port.pending
            .ops
            .extend(keys.iter().map(|k| PendingOp::Remove(RowKey::from_value(k))));
        Ok(())
    }

    /// Commit every non-empty port batch, in ascending port order, refreshing
    /// views and notifying their update subscribers once per flushed port.
    pub fn flush(&self) -> FlushReport {
        let mut state = self.state.lock();
        let mut report = FlushReport::default();
        for port_id in 0..state.ports.len() {
            if state.ports[port_id].pending.is_empty() {
                continue;
            }
            let delta = std::mem::take(&mut state.ports[port_id].pending);
            let touched = state.apply(delta, &self.schema, self.index.as_deref());
            let port_id = port_id as u32;
            for view in state.views.values() {
                view.refresh(&state.rows);
                report.notifications += view.notify_update(port_id, &touched);
            }
            report.flushed_ports.push(port_id);
        }
        if !report.flushed_ports.is_empty() {
            tracing::debug!(
                table = %self.name,
                ports = ?report.flushed_ports,
                notifications = report.notifications,
                "flushed"
            );
        }
        report
    }

    /// Drop every row and every queued batch.
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    /// Replace the contents: clear, then queue `data` on the default port,
    /// both under one lock so no flush sees the table in between.
    ///
    /// # Errors
    ///
    /// Fails if `data` does not fit the schema; the table is left untouched.
    pub fn replace(&self, data: TableData) -> Result<(), TableError> {
        let rows = data.into_rows()?;
        self.check_rows(&rows)?;
        let mut state = self.state.lock();
        state.clear();
        state.queue(rows, DEFAULT_PORT)
    }

    /// Create a view over this table.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken, the table is deleted or the configuration
    /// does not fit the schema.
    pub fn create_view(
        &self,
        name: impl Into<String>,
        config: ViewConfig,
        client_id: Option<ClientId>,
    ) -> Result<Arc<View>, TableError> {
        let name = name.into();
        let mut state = self.state.lock();
        if state.deleted {
            return Err(TableError::InvalidData(format!(
                "table '{}' was deleted",
                self.name
            )));
        }
        if state.views.contains_key(&name) {
            return Err(TableError::AlreadyExists(name));
        }
        let view = Arc::new(View::new(
            name.clone(),
            self.name.clone(),
            config,
            &self.schema,
            client_id,
            Arc::clone(&self.codec),
            &state.rows,
        )?);
        state.views.insert(name, Arc::clone(&view));
        Ok(view)
    }

    /// Detach and delete a view, notifying its delete subscribers.
    pub fn remove_view(&self, name: &str) -> Option<Arc<View>> {
        let view = self.state.lock().views.remove(name)?;
        view.mark_deleted();
        Some(view)
    }

    /// Number of live views.
    pub fn view_count(&self) -> usize {
        self.state.lock().views.len()
    }

    /// Attach a delete subscriber.
    pub fn on_delete(&self, registration: CallbackRegistration) {
        self.state.lock().delete_callbacks.register(registration);
    }

    /// Detach the owner's delete subscriber.
    pub fn remove_delete(&self, client_id: Option<ClientId>, callback_id: i64) -> bool {
        self.state
            .lock()
            .delete_callbacks
            .remove(client_id, callback_id, CallbackKind::Delete)
    }

    /// Number of delete subscribers.
    pub fn callback_count(&self) -> usize {
        self.state.lock().delete_callbacks.len()
    }

    /// Whether the table has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// Delete the table and notify its delete subscribers.
    ///
    /// # Errors
    ///
    /// Returns `HasDependentViews` while views exist.
    pub fn delete(&self) -> Result<(), TableError> {
        let mut state = self.state.lock();
        if state.deleted {
            return Ok(());
        }
        if !state.views.is_empty() {
            return Err(TableError::HasDependentViews {
                table: self.name.clone(),
                views: state.views.len(),
            });
        }
        state.deleted = true;
        state.rows.clear();
        state.positions.clear();
        let notified = state.delete_callbacks.notify_delete(&self.name);
        tracing::debug!(table = %self.name, notified, "table deleted");
        Ok(())
    }
}
