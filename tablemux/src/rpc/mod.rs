//! Connection plumbing shared by both ends, and the client multiplexer.
//!
//! ```text
//!  caller ──call()──► Client ──Request──► WriteSerializer ──frames──► transport
//!                       ▲                                                │
//!                       │ resolve / push                                 ▼
//!               CorrelationTable ◄── handle_incoming ◄── ChunkReassembler ◄── FrameReader
//! ```
//!
//! The server side reuses [`reader`], [`writer`] and [`reassembler`] for its
//! connections; [`correlation`] and [`client`] are client-only.

pub mod client;
pub mod correlation;
pub mod reader;
pub mod reassembler;
pub mod writer;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ClientError;
use crate::wire::envelope::PushKind;

/// Successful result of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// JSON result.
    pub data: Value,
    /// Reassembled binary payload, for binary replies.
    pub payload: Option<Bytes>,
}

impl Reply {
    /// Build a reply.
    pub fn new(data: Value, payload: Option<Bytes>) -> Self {
        Self { data, payload }
    }

    /// Decode the JSON result.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Codec` if the data does not match `T`.
    pub fn json<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        Ok(serde_json::from_value(self.data)?)
    }

    /// The binary payload.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Protocol` if the reply carried none.
    pub fn binary(self) -> Result<Bytes, ClientError> {
        self.payload.ok_or_else(|| ClientError::Protocol {
            message: "expected a binary reply".to_string(),
        })
    }
}

/// Push notification delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    /// Subscription id (the id of the subscribing call).
    pub id: i64,
    /// Update or delete.
    pub event: PushKind,
    /// Event details.
    pub data: Value,
    /// Row delta, for `mode: "row"` update subscriptions.
    pub payload: Option<Bytes>,
}

impl PushEvent {
    /// An update event for `port_id`.
    pub fn update(id: i64, port_id: u32) -> Self {
        Self {
            id,
            event: PushKind::Update,
            data: serde_json::json!({ "port_id": port_id }),
            payload: None,
        }
    }

    /// Port whose flush triggered an update.
    pub fn port_id(&self) -> Option<u32> {
        self.data
            .get("port_id")
            .and_then(Value::as_u64)
            .and_then(|p| u32::try_from(p).ok())
    }
}
