//! # tablemux
//!
//! Multiplexed request/response and push protocol for shared data tables.
//!
//! A [`Server`] hosts named tables and the views derived from them. Many
//! logical clients share a few duplex byte streams; each [`Client`] issues
//! any number of concurrent method calls over one stream, receives exactly
//! one reply per call, and gets push notifications (`on_update`,
//! `on_delete`) routed back to the handler that subscribed.
//!
//! This crate provides:
//! - **Wire format**: length + CRC32C framed headers and binary chunks
//! - **Client multiplexer**: correlation of replies, push routing, chunk
//!   reassembly
//! - **Server sessions**: per-client ownership of views and callbacks, torn
//!   down exactly once
//! - **Reference table engine**: ports, flush and view materialization

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Server and client configuration.
pub mod config;

/// Error types for every protocol layer.
pub mod error;

/// Client multiplexer and the connection plumbing it shares with the server.
pub mod rpc;

/// Table host, sessions and connection serving.
pub mod server;

/// Reference table engine: tables, ports, views, callbacks.
pub mod table;

/// Frame codec and envelopes.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Config exports
pub use config::{ClientConfig, ServerConfig};

// Error exports
pub use error::{ClientError, MethodError, ProtocolError, TableError, WireError};

// RPC exports
pub use rpc::client::{Client, Subscription, TableHandle, ViewHandle};
pub use rpc::{PushEvent, Reply};

// Server exports
pub use server::{Outgoing, Server, Session, SessionState};

// Table exports
pub use table::callback::{ClientId, Notify, Sink, UpdateMode};
pub use table::codec::{ColumnarCodec, JsonColumnarCodec};
pub use table::view::{Filter, FilterOp, SortOrder, View, ViewConfig, Window};
pub use table::{ColumnType, Row, Schema, Table, TableData};

// Wire exports
pub use wire::envelope::{Command, PushKind, Request, Response, ResponseBody, TargetKind};
pub use wire::{Frame, MAX_FRAME_SIZE};
