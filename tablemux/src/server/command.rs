//! Closed command sets for table and view methods.
//!
//! The wire carries free-form method names and positional arguments; they are
//! parsed here into [`TableCommand`] / [`ViewCommand`] so dispatch is an
//! exhaustive match.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ProtocolError;
use crate::table::callback::UpdateMode;
use crate::table::view::Window;
use crate::table::{TableData, DEFAULT_PORT};
use crate::wire::envelope::{MethodCall, TargetKind};

/// Table name that addresses the server itself.
pub const SERVER_TARGET: &str = "";

/// A table method.
#[derive(Debug, Clone, PartialEq)]
pub enum TableCommand {
    /// Column name → type.
    Schema,
    /// Committed row count.
    Size,
    /// Column names.
    Columns,
    /// Primary index column.
    GetIndex,
    /// Queue rows on a port. `data` is `None` when it travels as a binary
    /// payload.
    Update {
        /// Rows, unless binary.
        data: Option<TableData>,
        /// Target port.
        port_id: u32,
    },
    /// Queue removals on a port.
    Remove {
        /// Primary keys.
        keys: Vec<Value>,
        /// Target port.
        port_id: u32,
    },
    /// Allocate a port.
    MakePort,
    /// Replace the contents.
    Replace {
        /// Rows, unless binary.
        data: Option<TableData>,
    },
    /// Drop every row.
    Clear,
    /// Delete the table.
    Delete,
    /// Subscribe to deletion.
    OnDelete,
    /// Drop a delete subscription.
    RemoveDelete {
        /// Subscription to drop.
        callback_id: i64,
    },
    /// Names of all hosted tables (server target only).
    HostedTableNames,
}

impl TableCommand {
    /// Parse a table method call. `binary` says whether a payload came with it.
    ///
    /// # Errors
    ///
    /// `UnknownMethod` for an unknown selector, `InvalidArguments` otherwise.
    pub fn parse(call: &MethodCall, binary: bool) -> Result<Self, ProtocolError> {
        if call.name == SERVER_TARGET {
            return match call.method.as_str() {
                "get_hosted_table_names" => Ok(TableCommand::HostedTableNames),
                _ => Err(unknown(TargetKind::Table, call)),
            };
        }
        let command = match call.method.as_str() {
            "schema" => TableCommand::Schema,
            "size" => TableCommand::Size,
            "columns" => TableCommand::Columns,
            "get_index" => TableCommand::GetIndex,
            "update" => TableCommand::Update {
                data: data_arg(call, binary)?,
                port_id: port_arg(call, 1)?,
            },
            "remove" => TableCommand::Remove {
                keys: required_arg(call, 0)?,
                port_id: port_arg(call, 1)?,
            },
            "make_port" => TableCommand::MakePort,
            "replace" => TableCommand::Replace {
                data: data_arg(call, binary)?,
            },
            "clear" => TableCommand::Clear,
            "delete" => TableCommand::Delete,
            "on_delete" => TableCommand::OnDelete,
            "remove_delete" => TableCommand::RemoveDelete {
                callback_id: callback_arg(call)?,
            },
            _ => return Err(unknown(TargetKind::Table, call)),
        };
        Ok(command)
    }

    /// Whether the command installs a push route.
    pub fn is_subscription(&self) -> bool {
        matches!(self, TableCommand::OnDelete)
    }

    /// Whether the command writes to the table.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            TableCommand::Update { .. }
                | TableCommand::Remove { .. }
                | TableCommand::Replace { .. }
                | TableCommand::Clear
                | TableCommand::Delete
        )
    }
}

/// A view method.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewCommand {
    /// Rows as JSON objects.
    ToRecords(Window),
    /// Rows as `{column: [values]}`.
    ToColumns(Window),
    /// Rows as a binary columnar payload.
    ToArrow(Window),
    /// Row count.
    NumRows,
    /// Column count.
    NumColumns,
    /// Column name → type.
    Schema,
    /// Query configuration.
    GetConfig,
    /// Subscribe to updates.
    OnUpdate {
        /// Plain notification or row delta.
        mode: UpdateMode,
    },
    /// Drop an update subscription.
    RemoveUpdate {
        /// Subscription to drop.
        callback_id: i64,
    },
    /// Subscribe to deletion.
    OnDelete,
    /// Drop a delete subscription.
    RemoveDelete {
        /// Subscription to drop.
        callback_id: i64,
    },
    /// Delete the view.
    Delete,
}

impl ViewCommand {
    /// Parse a view method call.
    ///
    /// # Errors
    ///
    /// `UnknownMethod` for an unknown selector, `InvalidArguments` otherwise.
    pub fn parse(call: &MethodCall) -> Result<Self, ProtocolError> {
        let command = match call.method.as_str() {
            "to_records" | "to_json" => ViewCommand::ToRecords(optional_arg(call, 0)?.unwrap_or_default()),
            "to_columns" => ViewCommand::ToColumns(optional_arg(call, 0)?.unwrap_or_default()),
            "to_arrow" => ViewCommand::ToArrow(optional_arg(call, 0)?.unwrap_or_default()),
            "num_rows" => ViewCommand::NumRows,
            "num_columns" => ViewCommand::NumColumns,
            "schema" => ViewCommand::Schema,
            "get_config" => ViewCommand::GetConfig,
            "on_update" => ViewCommand::OnUpdate {
                mode: mode_arg(call)?,
            },
            "remove_update" => ViewCommand::RemoveUpdate {
                callback_id: callback_arg(call)?,
            },
            "on_delete" => ViewCommand::OnDelete,
            "remove_delete" => ViewCommand::RemoveDelete {
                callback_id: callback_arg(call)?,
            },
            "delete" => ViewCommand::Delete,
            _ => return Err(unknown(TargetKind::View, call)),
        };
        Ok(command)
    }

    /// Whether the command installs a push route.
    pub fn is_subscription(&self) -> bool {
        matches!(self, ViewCommand::OnUpdate { .. } | ViewCommand::OnDelete)
    }
}

fn unknown(kind: TargetKind, call: &MethodCall) -> ProtocolError {
    ProtocolError::UnknownMethod {
        kind,
        method: call.method.clone(),
    }
}

fn invalid(call: &MethodCall, message: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidArguments {
        method: call.method.clone(),
        message: message.into(),
    }
}

/// Argument at `index`; missing and `null` both read as `None`.
fn optional_arg<T: DeserializeOwned>(call: &MethodCall, index: usize) -> Result<Option<T>, ProtocolError> {
    match call.args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| invalid(call, format!("argument {index}: {e}"))),
    }
}

fn required_arg<T: DeserializeOwned>(call: &MethodCall, index: usize) -> Result<T, ProtocolError> {
    optional_arg(call, index)?.ok_or_else(|| invalid(call, format!("missing argument {index}")))
}

fn data_arg(call: &MethodCall, binary: bool) -> Result<Option<TableData>, ProtocolError> {
    if binary {
        return Ok(None);
    }
    required_arg(call, 0).map(Some)
}

#[derive(Deserialize)]
struct PortOptions {
    #[serde(default)]
    port_id: Option<u32>,
}

fn port_arg(call: &MethodCall, index: usize) -> Result<u32, ProtocolError> {
    Ok(optional_arg::<PortOptions>(call, index)?
        .and_then(|o| o.port_id)
        .unwrap_or(DEFAULT_PORT))
}

#[derive(Deserialize)]
struct UpdateOptions {
    #[serde(default)]
    mode: Option<String>,
}

fn mode_arg(call: &MethodCall) -> Result<UpdateMode, ProtocolError> {
    let mode = optional_arg::<UpdateOptions>(call, 0)?.and_then(|o| o.mode);
    match mode.as_deref() {
        None | Some("") => Ok(UpdateMode::Plain),
        Some("row") => Ok(UpdateMode::Row),
        Some(other) => Err(invalid(call, format!("unknown update mode '{other}'"))),
    }
}

fn callback_arg(call: &MethodCall) -> Result<i64, ProtocolError> {
    match call.callback_id {
        Some(id) => Ok(id),
        None => required_arg(call, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, method: &str, args: Vec<Value>) -> MethodCall {
        MethodCall {
            name: name.to_string(),
            method: method.to_string(),
            args,
            subscribe: false,
            callback_id: None,
        }
    }

    #[test]
    fn test_update_defaults_to_port_zero() {
        let command =
            TableCommand::parse(&call("t", "update", vec![json!({"a": [1]})]), false).expect("parse");
        let TableCommand::Update { data, port_id } = command else {
            panic!("expected update");
        };
        assert_eq!(port_id, DEFAULT_PORT);
        assert!(matches!(data, Some(TableData::Columns(_))));
    }

    #[test]
    fn test_update_with_port() {
        let command = TableCommand::parse(
            &call("t", "update", vec![json!([{"a": 1}]), json!({"port_id": 3})]),
            false,
        )
        .expect("parse");
        assert!(matches!(command, TableCommand::Update { port_id: 3, .. }));
        assert!(command.is_mutation());
    }

    #[test]
    fn test_binary_update_needs_no_data_arg() {
        let command = TableCommand::parse(
            &call("t", "update", vec![Value::Null, json!({"port_id": 1})]),
            true,
        )
        .expect("parse");
        assert_eq!(
            command,
            TableCommand::Update {
                data: None,
                port_id: 1
            }
        );
    }

    #[test]
    fn test_missing_data_rejected() {
        let result = TableCommand::parse(&call("t", "update", vec![]), false);
        assert!(matches!(result, Err(ProtocolError::InvalidArguments { .. })));
    }

    #[test]
    fn test_unknown_method() {
        let result = TableCommand::parse(&call("t", "explode", vec![]), false);
        assert_eq!(
            result,
            Err(ProtocolError::UnknownMethod {
                kind: TargetKind::Table,
                method: "explode".to_string()
            })
        );
    }

    #[test]
    fn test_server_target() {
        assert_eq!(
            TableCommand::parse(&call("", "get_hosted_table_names", vec![]), false),
            Ok(TableCommand::HostedTableNames)
        );
        assert!(TableCommand::parse(&call("", "size", vec![]), false).is_err());
    }

    #[test]
    fn test_callback_id_from_field_or_arg() {
        let mut c = call("v", "remove_update", vec![]);
        c.callback_id = Some(12);
        assert_eq!(
            ViewCommand::parse(&c),
            Ok(ViewCommand::RemoveUpdate { callback_id: 12 })
        );
        assert_eq!(
            ViewCommand::parse(&call("v", "remove_update", vec![json!(4)])),
            Ok(ViewCommand::RemoveUpdate { callback_id: 4 })
        );
        assert!(ViewCommand::parse(&call("v", "remove_update", vec![])).is_err());
    }

    #[test]
    fn test_on_update_modes() {
        assert_eq!(
            ViewCommand::parse(&call("v", "on_update", vec![])),
            Ok(ViewCommand::OnUpdate {
                mode: UpdateMode::Plain
            })
        );
        let command =
            ViewCommand::parse(&call("v", "on_update", vec![json!({"mode": "row"})])).expect("parse");
        assert_eq!(command, ViewCommand::OnUpdate { mode: UpdateMode::Row });
        assert!(command.is_subscription());
        assert!(ViewCommand::parse(&call("v", "on_update", vec![json!({"mode": "cell"})])).is_err());
    }

    #[test]
    fn test_window_arg() {
        assert_eq!(
            ViewCommand::parse(&call(
                "v",
                "to_records",
                vec![json!({"start_row": 1, "end_row": 3})]
            )),
            Ok(ViewCommand::ToRecords(Window::rows(1, 3)))
        );
        assert_eq!(
            ViewCommand::parse(&call("v", "to_arrow", vec![])),
            Ok(ViewCommand::ToArrow(Window::default()))
        );
    }
}
