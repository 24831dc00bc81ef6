//! Table host and connection acceptor.
//!
//! A [`Server`] owns the hosted tables, the views created over them and one
//! [`Session`] per connected client. It is cheap to clone; every clone shares
//! the same state.
//!
//! ```text
//!             ┌────────── Server ──────────┐
//!  conn A ──► │ Session(client-1) ─┐       │
//!  conn B ──► │ Session(client-2) ─┼─► tables / views
//!             └────────────────────┴───────┘
//! ```

pub mod command;
mod connection;
pub mod session;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::error::{MethodError, ProtocolError, TableError};
use crate::table::callback::{ClientId, Notification};
use crate::table::codec::{ColumnarCodec, JsonColumnarCodec};
use crate::table::view::{View, ViewConfig};
use crate::table::{Table, TableData};
use crate::wire::envelope::TargetKind;

pub use session::{Outgoing, Session, SessionState};

pub(crate) struct ServerInner {
    config: ServerConfig,
    codec: Arc<dyn ColumnarCodec>,
    tables: RwLock<BTreeMap<String, Arc<Table>>>,
    views: RwLock<BTreeMap<String, Arc<View>>>,
    sessions: Mutex<HashMap<ClientId, Arc<Session>>>,
    next_client_id: AtomicU64,
    locked: AtomicBool,
}

/// Hosts tables and serves connections.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("tables", &self.hosted_tables())
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl Server {
    /// Create a server encoding binary payloads as JSON columns.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_codec(config, Arc::new(JsonColumnarCodec))
    }

    /// Create a server with a custom columnar codec.
    pub fn with_codec(config: ServerConfig, codec: Arc<dyn ColumnarCodec>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                codec,
                tables: RwLock::new(BTreeMap::new()),
                views: RwLock::new(BTreeMap::new()),
                sessions: Mutex::new(HashMap::new()),
                next_client_id: AtomicU64::new(1),
                locked: AtomicBool::new(false),
            }),
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Codec used for binary table data.
    pub fn codec(&self) -> &Arc<dyn ColumnarCodec> {
        &self.inner.codec
    }

    // Tables

    /// Host an existing table under its own name.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the name is taken.
    pub fn host_table(&self, table: Table) -> Result<Arc<Table>, TableError> {
        let mut tables = self.inner.tables.write();
        if tables.contains_key(table.name()) {
            return Err(TableError::AlreadyExists(table.name().to_string()));
        }
        let table = Arc::new(table);
        tables.insert(table.name().to_string(), Arc::clone(&table));
        tracing::info!(table = %table.name(), rows = table.size(), "hosting table");
        Ok(table)
    }

    /// Build a table from data and host it.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken or the data is invalid.
    pub fn create_table(
        &self,
        name: impl Into<String>,
        data: TableData,
        index: Option<String>,
    ) -> Result<Arc<Table>, TableError> {
        let table = Table::with_codec(name, data, index, Arc::clone(&self.inner.codec))?;
        self.host_table(table)
    }

    /// Look a table up by name.
    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.inner.tables.read().get(name).cloned()
    }

    /// Names of the hosted tables, sorted.
    pub fn hosted_tables(&self) -> Vec<String> {
        self.inner.tables.read().keys().cloned().collect()
    }

    /// Delete a hosted table. Returns `false` if no such table exists.
    ///
    /// # Errors
    ///
    /// `HasDependentViews` while views over it exist.
    pub fn delete_table(&self, name: &str) -> Result<bool, TableError> {
        let mut tables = self.inner.tables.write();
        let Some(table) = tables.get(name) else {
            return Ok(false);
        };
        table.delete()?;
        tables.remove(name);
        tracing::info!(table = %name, "table deleted");
        Ok(true)
    }

    // Views

    /// Create a view owned by the host rather than any session.
    ///
    /// # Errors
    ///
    /// See [`Server::create_view`].
    pub fn host_view(
        &self,
        view_name: &str,
        table_name: &str,
        config: ViewConfig,
    ) -> Result<Arc<View>, MethodError> {
        self.create_view(view_name, table_name, config, None)
    }

    /// Create a view over a hosted table. View names are unique per server.
    ///
    /// # Errors
    ///
    /// `UnknownTarget` for a missing table, `AlreadyExists` for a taken name,
    /// or whatever the table raises for the configuration.
    pub fn create_view(
        &self,
        view_name: &str,
        table_name: &str,
        config: ViewConfig,
        client_id: Option<ClientId>,
    ) -> Result<Arc<View>, MethodError> {
        let table = self
            .table(table_name)
            .ok_or_else(|| ProtocolError::UnknownTarget {
                kind: TargetKind::Table,
                name: table_name.to_string(),
            })?;
        let mut views = self.inner.views.write();
        if views.contains_key(view_name) {
            return Err(TableError::AlreadyExists(view_name.to_string()).into());
        }
        let view = table.create_view(view_name, config, client_id)?;
        views.insert(view_name.to_string(), Arc::clone(&view));
        tracing::debug!(view = %view_name, table = %table_name, ?client_id, "view created");
        Ok(view)
    }

    /// Look a view up by name.
    pub fn view(&self, name: &str) -> Option<Arc<View>> {
        self.inner.views.read().get(name).cloned()
    }

    /// Delete a view, notifying its delete subscribers.
    pub fn remove_view(&self, name: &str) -> Option<Arc<View>> {
        let view = self.inner.views.write().remove(name)?;
        match self.table(view.table_name()) {
            Some(table) => {
                table.remove_view(name);
            }
            None => {
                view.mark_deleted();
            }
        }
        tracing::debug!(view = %name, "view deleted");
        Some(view)
    }

    // Lock

    /// Make hosted tables read-only for clients.
    pub fn lock(&self) {
        self.inner.locked.store(true, Ordering::SeqCst);
    }

    /// Allow clients to mutate hosted tables again.
    pub fn unlock(&self) {
        self.inner.locked.store(false, Ordering::SeqCst);
    }

    /// Whether client mutations are rejected.
    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::SeqCst)
    }

    // Sessions

    /// Open a session. Its pushes arrive on the returned receiver.
    pub fn new_session(&self) -> (Arc<Session>, mpsc::UnboundedReceiver<Notification>) {
        let client_id = ClientId::new(self.inner.next_client_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(client_id, Arc::downgrade(&self.inner), tx));
        self.inner
            .sessions
            .lock()
            .insert(client_id, Arc::clone(&session));
        tracing::info!(%client_id, "session opened");
        (session, rx)
    }

    /// Look a session up by client id.
    pub fn session(&self, client_id: ClientId) -> Option<Arc<Session>> {
        self.inner.sessions.lock().get(&client_id).cloned()
    }

    /// Close a session. Returns `false` if it was unknown or already closed.
    pub fn close_session(&self, client_id: ClientId) -> bool {
        match self.session(client_id) {
            Some(session) => session.close(),
            None => false,
        }
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub(crate) fn forget_session(&self, client_id: ClientId) {
        self.inner.sessions.lock().remove(&client_id);
    }

    // Serving

    /// Serve one connection until the peer closes it. The connection's
    /// session is closed on return.
    ///
    /// # Errors
    ///
    /// Transport errors and unrecoverable framing errors.
    pub async fn serve_connection<S>(&self, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        connection::run(self.clone(), stream).await
    }

    /// Accept connections forever, one task each.
    ///
    /// # Errors
    ///
    /// Returns when `accept` fails.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), "listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, error = %e, "set_nodelay failed");
            }
            tracing::info!(%peer, "accepted connection");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    tracing::warn!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: serde_json::Value) -> TableData {
        serde_json::from_value(value).expect("data")
    }

    #[test]
    fn test_host_and_lookup() {
        let server = Server::default();
        server
            .create_table("b", data(json!({"x": [1]})), None)
            .expect("b");
        server
            .create_table("a", data(json!({"x": [1]})), None)
            .expect("a");
        assert_eq!(server.hosted_tables(), vec!["a", "b"]);
        assert!(matches!(
            server.create_table("a", data(json!({"x": [2]})), None),
            Err(TableError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_view_names_unique_across_tables() {
        let server = Server::default();
        server.create_table("a", data(json!({"x": [1]})), None).expect("a");
        server.create_table("b", data(json!({"x": [1]})), None).expect("b");
        server
            .host_view("v", "a", ViewConfig::default())
            .expect("v");
        assert!(matches!(
            server.host_view("v", "b", ViewConfig::default()),
            Err(MethodError::Table(TableError::AlreadyExists(_)))
        ));
        assert!(matches!(
            server.host_view("w", "missing", ViewConfig::default()),
            Err(MethodError::Protocol(ProtocolError::UnknownTarget { .. }))
        ));
    }

    #[test]
    fn test_delete_table_blocked_by_views() {
        let server = Server::default();
        server.create_table("a", data(json!({"x": [1]})), None).expect("a");
        server
            .host_view("v", "a", ViewConfig::default())
            .expect("v");

        assert!(matches!(
            server.delete_table("a"),
            Err(TableError::HasDependentViews { views: 1, .. })
        ));
        let view = server.remove_view("v").expect("removed");
        assert!(view.is_deleted());
        assert_eq!(server.delete_table("a"), Ok(true));
        assert_eq!(server.delete_table("a"), Ok(false));
        assert!(server.hosted_tables().is_empty());
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let server = Server::default();
        let (s1, _rx1) = server.new_session();
        let (s2, _rx2) = server.new_session();
        assert_ne!(s1.client_id(), s2.client_id());
        assert_eq!(server.session_count(), 2);

        assert!(server.close_session(s1.client_id()));
        assert!(!server.close_session(s1.client_id()));
        assert_eq!(server.session_count(), 1);
    }

    #[test]
    fn test_lock_toggle() {
        let server = Server::default();
        assert!(!server.is_locked());
        server.lock();
        assert!(server.is_locked());
        server.unlock();
        assert!(!server.is_locked());
    }
}
