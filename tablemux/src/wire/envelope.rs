//! Request and response envelopes carried in header frames.
//!
//! ```text
//! client → server   {"id":3,"cmd":"view_method","name":"v1","method":"to_records","args":[]}
//! server → client   {"id":3,"kind":"reply","data":[{"a":1}]}
//! server → client   {"id":7,"kind":"push","event":"update","data":{"port_id":0},
//!                    "is_binary":true,"byte_length":812}
//! ```
//!
//! `is_binary` marks the envelope as the header of a transfer whose
//! `byte_length` bytes follow in chunk frames sharing the same `id`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Id of the one-shot `init` message; no reply is correlated with it.
pub const INIT_ID: i64 = -1;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Kind of object a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A hosted table.
    Table,
    /// A view derived from a table.
    View,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Table => write!(f, "table"),
            TargetKind::View => write!(f, "view"),
        }
    }
}

/// Options accepted when creating a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    /// Primary key column used for upserts and removals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

/// Invocation of a named method on an existing table or view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    /// Table or view name.
    pub name: String,
    /// Method selector.
    pub method: String,
    /// Method-specific arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Whether this call installs a standing push route under its id.
    #[serde(default, skip_serializing_if = "is_false")]
    pub subscribe: bool,
    /// Registration to act on (`remove_update` / `remove_delete`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<i64>,
}

/// The `cmd` of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Connection handshake, sent once before any other traffic.
    Init,
    /// Create and host a table.
    Table {
        /// Table name.
        name: String,
        /// `[data]`: records, columns or a schema.
        #[serde(default)]
        args: Vec<Value>,
        /// Creation options.
        #[serde(default)]
        options: TableOptions,
    },
    /// Call a table method.
    TableMethod(MethodCall),
    /// Create a view owned by the sending session.
    View {
        /// Source table.
        table_name: String,
        /// Name of the new view.
        view_name: String,
        /// Query configuration.
        #[serde(default)]
        config: Value,
    },
    /// Call a view method.
    ViewMethod(MethodCall),
}

/// Client → server envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id; negative ids are fire-and-forget.
    pub id: i64,
    /// What to do.
    #[serde(flatten)]
    pub command: Command,
    /// Whether a binary payload follows in chunk frames.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_binary: bool,
    /// Payload size, present iff `is_binary`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_length: Option<u64>,
}

impl Request {
    /// Build a non-binary request.
    pub fn new(id: i64, command: Command) -> Self {
        Self {
            id,
            command,
            is_binary: false,
            byte_length: None,
        }
    }

    /// The connection handshake.
    pub fn init() -> Self {
        Self::new(INIT_ID, Command::Init)
    }

    /// Mark this request as the header of a binary transfer.
    pub fn with_binary(mut self, byte_length: u64) -> Self {
        self.is_binary = true;
        self.byte_length = Some(byte_length);
        self
    }

    /// Whether a reply is expected.
    pub fn expects_reply(&self) -> bool {
        self.id >= 0
    }

    /// Target addressed by this request, if any.
    pub fn target(&self) -> Option<(TargetKind, &str)> {
        match &self.command {
            Command::Init => None,
            Command::Table { name, .. } => Some((TargetKind::Table, name)),
            Command::TableMethod(call) => Some((TargetKind::Table, &call.name)),
            Command::View { view_name, .. } => Some((TargetKind::View, view_name)),
            Command::ViewMethod(call) => Some((TargetKind::View, &call.name)),
        }
    }

    /// Method selector, for logging.
    pub fn method(&self) -> &str {
        match &self.command {
            Command::Init => "init",
            Command::Table { .. } => "table",
            Command::View { .. } => "view",
            Command::TableMethod(call) | Command::ViewMethod(call) => &call.method,
        }
    }
}

/// Event carried by a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    /// A flush touched the subscribed view.
    Update,
    /// The subscribed table or view was deleted.
    Delete,
}

/// The `kind` of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Successful result of the call with the same id.
    Reply {
        /// Method result.
        #[serde(default)]
        data: Value,
    },
    /// The call with the same id failed.
    Error {
        /// Human-readable message.
        error: String,
    },
    /// Unsolicited notification for the subscription registered under the id.
    Push {
        /// What happened.
        event: PushKind,
        /// Event details (e.g. `{"port_id": 0}`).
        #[serde(default)]
        data: Value,
    },
}

/// Server → client envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request or subscription this answers.
    pub id: i64,
    /// Reply, error or push.
    #[serde(flatten)]
    pub body: ResponseBody,
    /// Whether a binary payload follows in chunk frames.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_binary: bool,
    /// Payload size, present iff `is_binary`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_length: Option<u64>,
}

impl Response {
    fn new(id: i64, body: ResponseBody) -> Self {
        Self {
            id,
            body,
            is_binary: false,
            byte_length: None,
        }
    }

    /// Successful reply.
    pub fn reply(id: i64, data: Value) -> Self {
        Self::new(id, ResponseBody::Reply { data })
    }

    /// Error reply.
    pub fn error(id: i64, error: impl Into<String>) -> Self {
        Self::new(
            id,
            ResponseBody::Error {
                error: error.into(),
            },
        )
    }

    /// Push notification for a standing subscription.
    pub fn push(id: i64, event: PushKind, data: Value) -> Self {
        Self::new(id, ResponseBody::Push { event, data })
    }

    /// Mark this response as the header of a binary transfer.
    pub fn with_binary(mut self, byte_length: u64) -> Self {
        self.is_binary = true;
        self.byte_length = Some(byte_length);
        self
    }
}
