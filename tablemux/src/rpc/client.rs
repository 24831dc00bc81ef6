//! Client multiplexer.
//!
//! One [`Client`] drives one connection. Any number of tasks may call through
//! it concurrently: each call gets its own id and waits on its own slot in the
//! [`CorrelationTable`]. A single reader task feeds every incoming frame to
//! [`Client::handle_incoming`], which reassembles binary transfers, resolves
//! replies and routes pushes to subscription sinks in arrival order.
//!
//! # Example
//!
//! ```rust,no_run
//! use tablemux::config::ClientConfig;
//! use tablemux::rpc::client::Client;
//! use tablemux::table::view::ViewConfig;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), tablemux::error::ClientError> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:8080").await?;
//! let client = Client::connect(stream, ClientConfig::default()).await?;
//!
//! let table = client.table("prices");
//! table.update(&json!({"symbol": ["ACME"], "price": [12.5]})).await?;
//! let view = table.view("cheap", ViewConfig::default()).await?;
//! let rows = view.to_records().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::{ClientError, ProtocolError};
use crate::rpc::correlation::CorrelationTable;
use crate::rpc::reader::FrameReader;
use crate::rpc::reassembler::ChunkReassembler;
use crate::rpc::writer::WriteSerializer;
use crate::rpc::{PushEvent, Reply};
use crate::table::callback::{Sink, UpdateMode};
use crate::table::view::{ViewConfig, Window};
use crate::table::{ColumnType, Row};
use crate::wire::envelope::{
    Command, MethodCall, Request, Response, ResponseBody, TableOptions, TargetKind,
};
use crate::wire::Frame;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ClientInner {
    config: ClientConfig,
    next_id: AtomicI64,
    correlation: Mutex<CorrelationTable>,
    transfers: Mutex<ChunkReassembler<Response>>,
    writer: WriteSerializer<BoxedWriter>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn handle_incoming(&self, frame: Frame) {
        match frame {
            Frame::Header(json) => {
                let response: Response = match serde_json::from_slice(&json) {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed envelope");
                        return;
                    }
                };
                if !response.is_binary {
                    self.dispatch(response, None);
                    return;
                }

                let id = response.id;
                let declared = response.byte_length.unwrap_or(0);
                let mut transfers = self.transfers.lock();
                if let Err(e) = transfers.begin(id, declared, response) {
                    transfers.discard(id);
                    drop(transfers);
                    self.fail_transfer(id, e);
                    return;
                }
                let complete = transfers.take(id);
                drop(transfers);
                if let Some((header, payload)) = complete {
                    self.dispatch(header, Some(payload));
                }
            }
            Frame::Chunk(chunk) => {
                let mut transfers = self.transfers.lock();
                match transfers.append(chunk.id, chunk.offset, &chunk.bytes) {
                    Ok(true) => {
                        let complete = transfers.take(chunk.id);
                        drop(transfers);
                        if let Some((header, payload)) = complete {
                            self.dispatch(header, Some(payload));
                        }
                    }
                    Ok(false) => {}
                    Err(e @ ProtocolError::UnknownTransfer { .. }) => {
                        drop(transfers);
                        tracing::warn!(error = %e, "dropping stray chunk");
                    }
                    Err(e) => {
                        transfers.discard(chunk.id);
                        drop(transfers);
                        self.fail_transfer(chunk.id, e);
                    }
                }
            }
        }
    }

    fn fail_transfer(&self, id: i64, error: ProtocolError) {
        tracing::warn!(id, error = %error, "binary transfer failed");
        self.correlation.lock().resolve(
            id,
            Err(ClientError::Protocol {
                message: error.to_string(),
            }),
        );
    }

    fn dispatch(&self, response: Response, payload: Option<Bytes>) {
        let id = response.id;
        match response.body {
            ResponseBody::Reply { data } => {
                self.correlation
                    .lock()
                    .resolve(id, Ok(Reply::new(data, payload)));
            }
            ResponseBody::Error { error } => {
                self.correlation
                    .lock()
                    .resolve(id, Err(ClientError::Method { message: error }));
            }
            ResponseBody::Push { event, data } => {
                let Some(sink) = self.correlation.lock().push_route(id) else {
                    tracing::warn!(id, ?event, "push for unknown subscription, dropping");
                    return;
                };
                let delivered = sink.deliver(PushEvent {
                    id,
                    event,
                    data,
                    payload,
                });
                if !delivered {
                    tracing::debug!(id, "subscriber gone, removing route");
                    self.correlation.lock().unsubscribe(id);
                }
            }
        }
    }

    fn shutdown(&self, reason: ClientError) {
        let incomplete = self.transfers.lock().discard_all();
        if !incomplete.is_empty() {
            tracing::debug!(ids = ?incomplete, "discarding incomplete transfers");
        }
        let resolved = self.correlation.lock().cancel_all(reason.clone());
        if resolved > 0 {
            tracing::info!(resolved, reason = %reason, "failed pending calls on disconnect");
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // The reader only holds a weak reference; stop it so the read half
        // (and with it the stream) is released.
        if let Some(handle) = self.reader_task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(inner: Weak<ClientInner>, mut reader: FrameReader<R>) {
    let reason = loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.handle_incoming(frame);
            }
            Ok(None) => break "connection closed by peer".to_string(),
            Err(e) => break format!("read failed: {e}"),
        }
    };
    tracing::debug!(reason = %reason, "client read loop ended");
    if let Some(inner) = inner.upgrade() {
        inner.shutdown(ClientError::disconnected(reason));
    }
}

/// Multiplexed client for one connection. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Send the `init` handshake over `stream` and start the reader task.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Io` if the handshake cannot be written.
    pub async fn connect<S>(stream: S, config: ClientConfig) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: BoxedWriter = Box::new(write_half);
        let inner = Arc::new(ClientInner {
            writer: WriteSerializer::new(
                writer,
                config.effective_chunk_size(),
                config.max_frame_size,
            ),
            next_id: AtomicI64::new(0),
            correlation: Mutex::new(CorrelationTable::new()),
            transfers: Mutex::new(ChunkReassembler::new()),
            reader_task: Mutex::new(None),
            config,
        });

        inner.writer.send(Request::init(), None).await?;

        let reader = FrameReader::new(
            read_half,
            inner.config.read_buffer_size,
            inner.config.max_frame_size,
        );
        let handle = tokio::spawn(read_loop(Arc::downgrade(&inner), reader));
        *inner.reader_task.lock() = Some(handle);
        Ok(Self { inner })
    }

    /// Feed one incoming frame. The reader task calls this for every frame;
    /// it is public for transports that read frames themselves.
    pub fn handle_incoming(&self, frame: Frame) {
        self.inner.handle_incoming(frame);
    }

    async fn request(
        &self,
        command: Command,
        payload: Option<Bytes>,
        sink: Option<Sink<PushEvent>>,
        timeout: Option<Duration>,
    ) -> Result<(i64, Reply), ClientError> {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let removal = sink.as_ref().and_then(|_| removal_command(&command, id));
        let waiter = {
            let mut correlation = inner.correlation.lock();
            match sink {
                Some(sink) => correlation.subscribe(id, sink)?,
                None => correlation.register(id)?,
            }
        };

        let request = Request::new(id, command);
        tracing::debug!(id, method = request.method(), "sending request");
        if let Err(e) = inner.writer.send(request, payload).await {
            inner.correlation.lock().abandon(id);
            return Err(e.into());
        }

        let outcome = match timeout.or(inner.config.request_timeout) {
            Some(limit) => match tokio::time::timeout(limit, waiter).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    inner.correlation.lock().abandon(id);
                    tracing::debug!(id, "request timed out, abandoning");
                    if let Some(removal) = removal {
                        self.drop_registration(id, removal).await;
                    }
                    return Err(ClientError::Timeout);
                }
            },
            None => waiter.await,
        };
        let reply = outcome.map_err(|_| ClientError::disconnected("reply slot dropped"))??;
        Ok((id, reply))
    }

    /// Ask the server to drop the registration of an abandoned subscription.
    /// The reply is not awaited; its id has no waiter and is ignored.
    async fn drop_registration(&self, id: i64, removal: Command) {
        let removal_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(removal_id, removal);
        if let Err(e) = self.inner.writer.send(request, None).await {
            tracing::debug!(id, error = %e, "could not drop abandoned subscription");
        }
    }

    /// Send a command and wait for its reply.
    ///
    /// # Errors
    ///
    /// `Method` if the server-side call failed, `Disconnected` if the
    /// connection went away first, `Timeout` if the configured timeout elapsed.
    pub async fn call(&self, command: Command) -> Result<Reply, ClientError> {
        Ok(self.request(command, None, None, None).await?.1)
    }

    /// Like [`call`](Self::call) with an explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Reply, ClientError> {
        Ok(self.request(command, None, None, Some(timeout)).await?.1)
    }

    /// Send a command whose argument is a binary payload.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_binary(&self, command: Command, payload: Bytes) -> Result<Reply, ClientError> {
        Ok(self.request(command, Some(payload), None, None).await?.1)
    }

    /// Send a subscribing command. Its id stays routed to `sink` after the
    /// acknowledgement arrives; returns that id and the acknowledgement.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call). A failed acknowledgement leaves no route.
    pub async fn subscribe(
        &self,
        command: Command,
        sink: Sink<PushEvent>,
    ) -> Result<(i64, Reply), ClientError> {
        self.request(command, None, Some(sink), None).await
    }

    /// Handle to a hosted table.
    pub fn table(&self, name: impl Into<String>) -> TableHandle {
        TableHandle {
            client: self.clone(),
            name: name.into(),
        }
    }

    /// Handle to an existing view, whoever created it.
    pub fn view(&self, name: impl Into<String>) -> ViewHandle {
        ViewHandle {
            client: self.clone(),
            name: name.into(),
        }
    }

    /// Create and host a table from records, columns or a schema.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn create_table<T: Serialize>(
        &self,
        name: impl Into<String>,
        data: &T,
        options: TableOptions,
    ) -> Result<TableHandle, ClientError> {
        let name = name.into();
        self.call(Command::Table {
            name: name.clone(),
            args: vec![serde_json::to_value(data)?],
            options,
        })
        .await?;
        Ok(self.table(name))
    }

    /// Names of every hosted table.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn hosted_tables(&self) -> Result<Vec<String>, ClientError> {
        self.call(Command::TableMethod(method_call("", "get_hosted_table_names", vec![])))
            .await?
            .json()
    }

    /// Calls still waiting for their first reply.
    pub fn pending_count(&self) -> usize {
        self.inner.correlation.lock().pending_count()
    }

    /// Whether the connection has been declared lost. Every later call fails
    /// with `Disconnected`.
    pub fn is_closed(&self) -> bool {
        self.inner.correlation.lock().is_closed()
    }

    /// Stop reading, fail every pending call with `Disconnected` and shut the
    /// write half down.
    pub async fn close(&self) {
        let handle = self.inner.reader_task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.inner
            .shutdown(ClientError::disconnected("client closed"));
        if let Err(e) = self.inner.writer.shutdown().await {
            tracing::debug!(error = %e, "shutdown of write half failed");
        }
    }
}

fn method_call(name: &str, method: &str, args: Vec<Value>) -> MethodCall {
    MethodCall {
        name: name.to_string(),
        method: method.to_string(),
        args,
        subscribe: false,
        callback_id: None,
    }
}

/// The call that undoes the subscribing `command` registered under `id`.
fn removal_command(command: &Command, id: i64) -> Option<Command> {
    let (call, wrap): (&MethodCall, fn(MethodCall) -> Command) = match command {
        Command::TableMethod(call) => (call, Command::TableMethod),
        Command::ViewMethod(call) => (call, Command::ViewMethod),
        _ => return None,
    };
    let remove_method = match call.method.as_str() {
        "on_update" => "remove_update",
        "on_delete" => "remove_delete",
        _ => return None,
    };
    Some(wrap(MethodCall {
        callback_id: Some(id),
        ..method_call(&call.name, remove_method, vec![])
    }))
}

fn port_arg(port_id: u32) -> Value {
    json!({ "port_id": port_id })
}

/// Remote table.
#[derive(Clone)]
pub struct TableHandle {
    client: Client,
    name: String,
}

impl TableHandle {
    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, ClientError> {
        self.client
            .call(Command::TableMethod(method_call(&self.name, method, args)))
            .await
    }

    /// Column name → type.
    pub async fn schema(&self) -> Result<BTreeMap<String, ColumnType>, ClientError> {
        self.call("schema", vec![]).await?.json()
    }

    /// Committed row count.
    pub async fn size(&self) -> Result<usize, ClientError> {
        self.call("size", vec![]).await?.json()
    }

    /// Column names.
    pub async fn columns(&self) -> Result<Vec<String>, ClientError> {
        self.call("columns", vec![]).await?.json()
    }

    /// Primary index column.
    pub async fn get_index(&self) -> Result<Option<String>, ClientError> {
        self.call("get_index", vec![]).await?.json()
    }

    /// Write records or columns through the default port.
    pub async fn update<T: Serialize>(&self, data: &T) -> Result<(), ClientError> {
        self.update_port(data, 0).await
    }

    /// Write records or columns through `port_id`.
    pub async fn update_port<T: Serialize>(&self, data: &T, port_id: u32) -> Result<(), ClientError> {
        self.call("update", vec![serde_json::to_value(data)?, port_arg(port_id)])
            .await?;
        Ok(())
    }

    /// Write a columnar binary payload through `port_id`.
    pub async fn update_binary(&self, payload: Bytes, port_id: u32) -> Result<(), ClientError> {
        let call = method_call(&self.name, "update", vec![Value::Null, port_arg(port_id)]);
        self.client
            .call_binary(Command::TableMethod(call), payload)
            .await?;
        Ok(())
    }

    /// Remove rows by primary key through the default port.
    pub async fn remove(&self, keys: Vec<Value>) -> Result<(), ClientError> {
        self.call("remove", vec![Value::Array(keys), port_arg(0)])
            .await?;
        Ok(())
    }

    /// Allocate a port.
    pub async fn make_port(&self) -> Result<u32, ClientError> {
        self.call("make_port", vec![]).await?.json()
    }

    /// Replace every row.
    pub async fn replace<T: Serialize>(&self, data: &T) -> Result<(), ClientError> {
        self.call("replace", vec![serde_json::to_value(data)?])
            .await?;
        Ok(())
    }

    /// Drop every row.
    pub async fn clear(&self) -> Result<(), ClientError> {
        self.call("clear", vec![]).await?;
        Ok(())
    }

    /// Delete the table. Fails while views depend on it.
    pub async fn delete(&self) -> Result<(), ClientError> {
        self.call("delete", vec![]).await?;
        Ok(())
    }

    /// Create a view owned by this connection's session.
    pub async fn view(
        &self,
        view_name: impl Into<String>,
        config: ViewConfig,
    ) -> Result<ViewHandle, ClientError> {
        let view_name = view_name.into();
        self.client
            .call(Command::View {
                table_name: self.name.clone(),
                view_name: view_name.clone(),
                config: serde_json::to_value(&config)?,
            })
            .await?;
        Ok(ViewHandle {
            client: self.client.clone(),
            name: view_name,
        })
    }

    /// Subscribe to deletion of the table.
    pub async fn on_delete(&self, sink: Sink<PushEvent>) -> Result<Subscription, ClientError> {
        let call = MethodCall {
            subscribe: true,
            ..method_call(&self.name, "on_delete", vec![])
        };
        let (id, _) = self
            .client
            .subscribe(Command::TableMethod(call), sink)
            .await?;
        Ok(Subscription {
            client: self.client.clone(),
            kind: TargetKind::Table,
            name: self.name.clone(),
            id,
            remove_method: "remove_delete",
        })
    }
}

/// Remote view.
#[derive(Clone)]
pub struct ViewHandle {
    client: Client,
    name: String,
}

impl ViewHandle {
    /// View name.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, ClientError> {
        self.client
            .call(Command::ViewMethod(method_call(&self.name, method, args)))
            .await
    }

    fn window_arg(window: Window) -> Result<Vec<Value>, ClientError> {
        Ok(vec![serde_json::to_value(window)?])
    }

    /// Every row as a JSON object.
    pub async fn to_records(&self) -> Result<Vec<Row>, ClientError> {
        self.to_records_window(Window::default()).await
    }

    /// Rows in `window` as JSON objects.
    pub async fn to_records_window(&self, window: Window) -> Result<Vec<Row>, ClientError> {
        self.call("to_records", Self::window_arg(window)?)
            .await?
            .json()
    }

    /// Every row as `{column: [values]}`.
    pub async fn to_columns(&self) -> Result<Map<String, Value>, ClientError> {
        self.call("to_columns", Self::window_arg(Window::default())?)
            .await?
            .json()
    }

    /// Every row, encoded by the server's columnar codec.
    pub async fn to_arrow(&self) -> Result<Bytes, ClientError> {
        self.call("to_arrow", Self::window_arg(Window::default())?)
            .await?
            .binary()
    }

    /// Row count.
    pub async fn num_rows(&self) -> Result<usize, ClientError> {
        self.call("num_rows", vec![]).await?.json()
    }

    /// Column count.
    pub async fn num_columns(&self) -> Result<usize, ClientError> {
        self.call("num_columns", vec![]).await?.json()
    }

    /// Column name → type of the projected columns.
    pub async fn schema(&self) -> Result<BTreeMap<String, ColumnType>, ClientError> {
        self.call("schema", vec![]).await?.json()
    }

    /// The view's query configuration.
    pub async fn get_config(&self) -> Result<ViewConfig, ClientError> {
        self.call("get_config", vec![]).await?.json()
    }

    async fn subscribe(
        &self,
        method: &str,
        args: Vec<Value>,
        remove_method: &'static str,
        sink: Sink<PushEvent>,
    ) -> Result<Subscription, ClientError> {
        let call = MethodCall {
            subscribe: true,
            ..method_call(&self.name, method, args)
        };
        let (id, _) = self
            .client
            .subscribe(Command::ViewMethod(call), sink)
            .await?;
        Ok(Subscription {
            client: self.client.clone(),
            kind: TargetKind::View,
            name: self.name.clone(),
            id,
            remove_method,
        })
    }

    /// Subscribe to flushes of the underlying table.
    pub async fn on_update(
        &self,
        mode: UpdateMode,
        sink: Sink<PushEvent>,
    ) -> Result<Subscription, ClientError> {
        let args = match mode {
            UpdateMode::Row => vec![json!({ "mode": "row" })],
            UpdateMode::Plain => vec![],
        };
        self.subscribe("on_update", args, "remove_update", sink)
            .await
    }

    /// Subscribe to deletion of the view.
    pub async fn on_delete(&self, sink: Sink<PushEvent>) -> Result<Subscription, ClientError> {
        self.subscribe("on_delete", vec![], "remove_delete", sink)
            .await
    }

    /// Delete the view.
    pub async fn delete(&self) -> Result<(), ClientError> {
        self.call("delete", vec![]).await?;
        Ok(())
    }
}

/// A standing push subscription.
pub struct Subscription {
    client: Client,
    kind: TargetKind,
    name: String,
    id: i64,
    remove_method: &'static str,
}

impl Subscription {
    /// Subscription id; pushes for it carry this id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Remove the server-side registration, then the local route.
    pub async fn unsubscribe(self) -> Result<(), ClientError> {
        let call = MethodCall {
            callback_id: Some(self.id),
            ..method_call(&self.name, self.remove_method, vec![])
        };
        let command = match self.kind {
            TargetKind::Table => Command::TableMethod(call),
            TargetKind::View => Command::ViewMethod(call),
        };
        let result = self.client.call(command).await;
        self.client.inner.correlation.lock().unsubscribe(self.id);
        result.map(|_| ())
    }
}
