//! Server-side state of one logical client.
//!
//! ```text
//!   Connected ──close()──► Closing ──► Closed
//! ```
//!
//! A session remembers the views it created and the callbacks it registered.
//! Closing removes exactly those, leaving other sessions' views and
//! registrations on the same tables alone. Tables are host-level and are never
//! removed by a session closing.
//!
//! A failing method produces an error reply for its id; the session stays
//! `Connected`. Requests that reach a session after it left `Connected` are
//! answered with [`ProtocolError::SessionClosed`].

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use crate::error::{MethodError, ProtocolError, TableError};
use crate::server::command::{TableCommand, ViewCommand, SERVER_TARGET};
use crate::server::{Server, ServerInner};
use crate::table::callback::{
    CallbackKind, CallbackRegistration, ClientId, Notification, Sink, UpdateMode,
};
use crate::table::view::{View, ViewConfig};
use crate::table::{Table, TableData};
use crate::wire::envelope::{Command, MethodCall, Request, Response, TableOptions, TargetKind};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Serving requests.
    Connected,
    /// Tearing down owned resources.
    Closing,
    /// Terminal.
    Closed,
}

/// An envelope ready to be written, with its binary tail if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    /// Header envelope.
    pub response: Response,
    /// Binary payload sent as chunks after the header.
    pub payload: Option<Bytes>,
}

impl Outgoing {
    /// Error reply for `id`.
    pub fn error(id: i64, error: impl ToString) -> Self {
        Self {
            response: Response::error(id, error.to_string()),
            payload: None,
        }
    }

    /// Push envelope for a notification.
    pub fn push(notification: Notification) -> Self {
        let data = match notification.port_id {
            Some(port_id) => json!({ "port_id": port_id }),
            None => Value::Null,
        };
        Self {
            response: Response::push(notification.callback_id, notification.event, data),
            payload: notification.delta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CallbackKey {
    kind: TargetKind,
    name: String,
    callback_id: i64,
}

struct SessionInner {
    state: SessionState,
    owned_views: BTreeSet<String>,
    owned_callbacks: HashSet<CallbackKey>,
}

type MethodResult = Result<(Value, Option<Bytes>), MethodError>;

/// One logical client of a [`Server`].
pub struct Session {
    client_id: ClientId,
    server: Weak<ServerInner>,
    push_tx: mpsc::UnboundedSender<Notification>,
    inner: Mutex<SessionInner>,
    closed: Notify,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        client_id: ClientId,
        server: Weak<ServerInner>,
        push_tx: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            client_id,
            server,
            push_tx,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connected,
                owned_views: BTreeSet::new(),
                owned_callbacks: HashSet::new(),
            }),
            closed: Notify::new(),
        }
    }

    /// Handle assigned at connect time.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Resolves once the session has left `Connected`.
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        if self.state() != SessionState::Connected {
            return;
        }
        notified.await;
    }

    /// Number of callbacks this session registered and has not removed.
    pub fn owned_callback_count(&self) -> usize {
        self.inner.lock().owned_callbacks.len()
    }

    /// Handle one JSON request envelope.
    ///
    /// An envelope that does not parse is answered with an error reply when
    /// its `id` can still be read, and dropped otherwise.
    pub fn handle_message(&self, bytes: &[u8]) -> Option<Outgoing> {
        match serde_json::from_slice::<Request>(bytes) {
            Ok(request) => self.handle_request(request, None),
            Err(e) => self.reject_malformed(bytes, &e.to_string()),
        }
    }

    /// Answer an envelope that could not be parsed as a request.
    pub fn reject_malformed(&self, bytes: &[u8], message: &str) -> Option<Outgoing> {
        let error = ProtocolError::MalformedEnvelope {
            message: message.to_string(),
        };
        let id = serde_json::from_slice::<Value>(bytes)
            .ok()
            .and_then(|v| v.get("id").and_then(Value::as_i64));
        tracing::warn!(client_id = %self.client_id, ?id, error = %error, "malformed request");
        id.filter(|id| *id >= 0)
            .map(|id| Outgoing::error(id, error))
    }

    /// Execute a request. Returns the reply to send, if the request expects
    /// one. Pushes triggered by the request go through the push channel.
    pub fn handle_request(&self, request: Request, payload: Option<Bytes>) -> Option<Outgoing> {
        let id = request.id;
        let expects_reply = request.expects_reply();
        let state = self.state();
        if state != SessionState::Connected {
            tracing::warn!(
                client_id = %self.client_id,
                id,
                ?state,
                "request on a session that is not connected"
            );
            return expects_reply.then(|| Outgoing::error(id, ProtocolError::SessionClosed));
        }

        let method = request.method().to_string();
        let target = request.target().map(|(_, name)| name.to_string());
        tracing::debug!(client_id = %self.client_id, id, method = %method, ?target, "dispatch");

        let result = self.execute(id, request.command, payload);
        if !expects_reply {
            if let Err(e) = result {
                tracing::warn!(client_id = %self.client_id, id, method = %method, error = %e, "fire-and-forget request failed");
            }
            return None;
        }
        match result {
            Ok((data, payload)) => Some(Outgoing {
                response: Response::reply(id, data),
                payload,
            }),
            Err(e) => {
                tracing::warn!(client_id = %self.client_id, id, method = %method, error = %e, "method failed");
                Some(Outgoing::error(id, e))
            }
        }
    }

    fn execute(&self, id: i64, command: Command, payload: Option<Bytes>) -> MethodResult {
        let server = self
            .server
            .upgrade()
            .map(|inner| Server { inner })
            .ok_or_else(|| TableError::InvalidData("server has shut down".to_string()))?;

        match command {
            Command::Init => Ok((Value::Null, None)),
            Command::Table {
                name,
                args,
                options,
            } => self.create_table(&server, name, args, options, payload),
            Command::TableMethod(call) => self.table_method(&server, id, call, payload),
            Command::View {
                table_name,
                view_name,
                config,
            } => self.create_view(&server, table_name, view_name, config),
            Command::ViewMethod(call) => self.view_method(&server, id, call),
        }
    }

    fn decode_data(
        server: &Server,
        data: Option<TableData>,
        payload: Option<Bytes>,
    ) -> Result<TableData, MethodError> {
        match (data, payload) {
            (_, Some(payload)) => Ok(server.codec().decode(&payload)?),
            (Some(data), None) => Ok(data),
            (None, None) => Err(TableError::InvalidData("no data".to_string()).into()),
        }
    }

    fn create_table(
        &self,
        server: &Server,
        name: String,
        args: Vec<Value>,
        options: TableOptions,
        payload: Option<Bytes>,
    ) -> MethodResult {
        if server.is_locked() {
            return Err(TableError::Locked.into());
        }
        let data = match args.into_iter().next() {
            Some(value) if !value.is_null() => {
                Some(serde_json::from_value(value).map_err(|e| ProtocolError::InvalidArguments {
                    method: "table".to_string(),
                    message: e.to_string(),
                })?)
            }
            _ => None,
        };
        let data = Self::decode_data(server, data, payload)?;
        server.create_table(name, data, options.index)?;
        Ok((Value::Null, None))
    }

    fn create_view(
        &self,
        server: &Server,
        table_name: String,
        view_name: String,
        config: Value,
    ) -> MethodResult {
        let config: ViewConfig = if config.is_null() {
            ViewConfig::default()
        } else {
            serde_json::from_value(config).map_err(|e| ProtocolError::InvalidArguments {
                method: "view".to_string(),
                message: e.to_string(),
            })?
        };
        server.create_view(&view_name, &table_name, config, Some(self.client_id))?;

        let mut inner = self.inner.lock();
        if inner.state != SessionState::Connected {
            // Closed while the view was being built; it is not ours to keep.
            drop(inner);
            server.remove_view(&view_name);
            return Err(ProtocolError::SessionClosed.into());
        }
        inner.owned_views.insert(view_name);
        Ok((Value::Null, None))
    }

    fn track(&self, kind: TargetKind, name: &str, callback_id: i64) {
        self.inner.lock().owned_callbacks.insert(CallbackKey {
            kind,
            name: name.to_string(),
            callback_id,
        });
    }

    fn untrack(&self, kind: TargetKind, name: &str, callback_id: i64) {
        self.inner.lock().owned_callbacks.remove(&CallbackKey {
            kind,
            name: name.to_string(),
            callback_id,
        });
    }

    fn registration(&self, callback_id: i64, kind: CallbackKind) -> CallbackRegistration {
        CallbackRegistration::new(
            callback_id,
            kind,
            Some(self.client_id),
            Sink::Channel(self.push_tx.clone()),
        )
    }

    fn table_method(
        &self,
        server: &Server,
        id: i64,
        call: MethodCall,
        payload: Option<Bytes>,
    ) -> MethodResult {
        let command = TableCommand::parse(&call, payload.is_some())?;
        check_subscribe_flag(&call, command.is_subscription())?;
        if call.name == SERVER_TARGET {
            return Ok((json!(server.hosted_tables()), None));
        }
        let table: Arc<Table> = server.table(&call.name).ok_or_else(|| ProtocolError::UnknownTarget {
            kind: TargetKind::Table,
            name: call.name.clone(),
        })?;
        if command.is_mutation() && server.is_locked() {
            return Err(TableError::Locked.into());
        }

        let data = match command {
            TableCommand::Schema => table.schema().to_json(),
            TableCommand::Size => json!(table.size()),
            TableCommand::Columns => json!(table.columns()),
            TableCommand::GetIndex => json!(table.index()),
            TableCommand::Update { data, port_id } => {
                let data = Self::decode_data(server, data, payload)?;
                table.update(data, port_id)?;
                table.flush();
                Value::Null
            }
            TableCommand::Remove { keys, port_id } => {
                table.remove(&keys, port_id)?;
                table.flush();
                Value::Null
            }
            TableCommand::MakePort => json!(table.make_port()),
            TableCommand::Replace { data } => {
                let data = Self::decode_data(server, data, payload)?;
                table.replace(data)?;
                table.flush();
                Value::Null
            }
            TableCommand::Clear => {
                table.clear();
                Value::Null
            }
            TableCommand::Delete => {
                server.delete_table(&call.name)?;
                Value::Null
            }
            TableCommand::OnDelete => {
                self.track(TargetKind::Table, &call.name, id);
                table.on_delete(self.registration(id, CallbackKind::Delete));
                Value::Null
            }
            TableCommand::RemoveDelete { callback_id } => {
                let removed = table.remove_delete(Some(self.client_id), callback_id);
                self.untrack(TargetKind::Table, &call.name, callback_id);
                json!(removed)
            }
            TableCommand::HostedTableNames => json!(server.hosted_tables()),
        };
        Ok((data, None))
    }

    fn view_method(&self, server: &Server, id: i64, call: MethodCall) -> MethodResult {
        let command = ViewCommand::parse(&call)?;
        check_subscribe_flag(&call, command.is_subscription())?;
        let view: Arc<View> = server.view(&call.name).ok_or_else(|| ProtocolError::UnknownTarget {
            kind: TargetKind::View,
            name: call.name.clone(),
        })?;

        let data = match command {
            ViewCommand::ToRecords(window) => Value::Array(
                view.to_records(window)
                    .into_iter()
                    .map(Value::Object)
                    .collect(),
            ),
            ViewCommand::ToColumns(window) => Value::Object(view.to_columns(window)),
            ViewCommand::ToArrow(window) => {
                return Ok((Value::Null, Some(view.to_binary(window)?)));
            }
            ViewCommand::NumRows => json!(view.num_rows()),
            ViewCommand::NumColumns => json!(view.num_columns()),
            ViewCommand::Schema => view.schema().to_json(),
            ViewCommand::GetConfig => serde_json::to_value(view.config())
                .map_err(|e| TableError::InvalidData(e.to_string()))?,
            ViewCommand::OnUpdate { mode } => {
                self.track(TargetKind::View, &call.name, id);
                view.register(self.registration(id, CallbackKind::Update(mode)));
                Value::Null
            }
            ViewCommand::RemoveUpdate { callback_id } => {
                let removed = view.remove_callback(
                    Some(self.client_id),
                    callback_id,
                    CallbackKind::Update(UpdateMode::Plain),
                );
                self.untrack(TargetKind::View, &call.name, callback_id);
                json!(removed)
            }
            ViewCommand::OnDelete => {
                self.track(TargetKind::View, &call.name, id);
                view.register(self.registration(id, CallbackKind::Delete));
                Value::Null
            }
            ViewCommand::RemoveDelete { callback_id } => {
                let removed =
                    view.remove_callback(Some(self.client_id), callback_id, CallbackKind::Delete);
                self.untrack(TargetKind::View, &call.name, callback_id);
                json!(removed)
            }
            ViewCommand::Delete => {
                if view.client_id() != Some(self.client_id) {
                    return Err(TableError::NotOwner(call.name).into());
                }
                server.remove_view(&call.name);
                self.inner.lock().owned_views.remove(&call.name);
                Value::Null
            }
        };
        Ok((data, None))
    }

    /// Tear down: drop this session's callbacks, delete its views, leave
    /// tables alone. Returns `false` if the session was already closing or
    /// closed.
    pub fn close(&self) -> bool {
        let (views, callbacks) = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Connected {
                return false;
            }
            inner.state = SessionState::Closing;
            (
                std::mem::take(&mut inner.owned_views),
                std::mem::take(&mut inner.owned_callbacks),
            )
        };

        if let Some(inner) = self.server.upgrade() {
            let server = Server { inner };
            for key in &callbacks {
                match key.kind {
                    TargetKind::Table => {
                        if let Some(table) = server.table(&key.name) {
                            table.remove_delete(Some(self.client_id), key.callback_id);
                        }
                    }
                    TargetKind::View => {
                        if let Some(view) = server.view(&key.name) {
                            view.remove_callback_id(Some(self.client_id), key.callback_id);
                        }
                    }
                }
            }
            for name in &views {
                server.remove_view(name);
            }
            server.forget_session(self.client_id);
        }

        self.inner.lock().state = SessionState::Closed;
        self.closed.notify_waiters();
        tracing::info!(
            client_id = %self.client_id,
            views = views.len(),
            callbacks = callbacks.len(),
            "session closed"
        );
        true
    }
}

/// The wire `subscribe` flag must match whether the method installs a push
/// route.
fn check_subscribe_flag(call: &MethodCall, installs_route: bool) -> Result<(), ProtocolError> {
    if call.subscribe == installs_route {
        return Ok(());
    }
    let message = if installs_route {
        "subscribing method sent without the subscribe flag"
    } else {
        "subscribe flag set on a method that does not subscribe"
    };
    Err(ProtocolError::InvalidArguments {
        method: call.method.clone(),
        message: message.to_string(),
    })
}
