//! Error types for the tablemux protocol layers.
//!
//! - [`WireError`]: a single frame could not be decoded
//! - [`ProtocolError`]: a frame decoded but broke the protocol (bad chunk
//!   offset, unknown target, ...). Logged and connection-local.
//! - [`TableError`]: the table engine refused a method call. Converted into an
//!   error reply carrying the request id.
//! - [`ClientError`]: what a caller awaiting a reply observes.

use crate::wire::envelope::TargetKind;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from header.
        expected: u32,
        /// Computed checksum from data.
        actual: u32,
    },

    /// Frame exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual frame size in bytes.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// Opcode byte is neither header nor chunk.
    #[error("unknown opcode: {opcode:#04x}")]
    UnknownOpcode {
        /// The opcode found in the frame.
        opcode: u8,
    },

    /// Chunk body is shorter than its fixed prefix.
    #[error("malformed chunk: body of {len} bytes")]
    MalformedChunk {
        /// Body length.
        len: usize,
    },
}

impl WireError {
    /// Whether the reader can skip past the offending frame and keep going.
    ///
    /// A bad length field leaves no way to find the next frame boundary.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            WireError::InvalidLength { .. } | WireError::FrameTooLarge { .. }
        )
    }
}

/// Protocol violations detected after a frame was decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame itself could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] WireError),

    /// The header frame did not contain a valid envelope.
    #[error("malformed envelope: {message}")]
    MalformedEnvelope {
        /// Parser message.
        message: String,
    },

    /// A chunk arrived at an offset other than the next expected one.
    #[error("out-of-order chunk for id {id}: expected offset {expected}, got {actual}")]
    OutOfOrderChunk {
        /// Transfer id.
        id: i64,
        /// Next expected offset.
        expected: u64,
        /// Offset carried by the chunk.
        actual: u64,
    },

    /// A chunk arrived for an id with no transfer in progress.
    #[error("chunk for unknown transfer id {id}")]
    UnknownTransfer {
        /// Transfer id.
        id: i64,
    },

    /// A transfer received more bytes than its header declared.
    #[error("transfer {id} overflow: declared {declared} bytes, received {received}")]
    ChunkOverflow {
        /// Transfer id.
        id: i64,
        /// Declared byte length.
        declared: u64,
        /// Bytes received so far, including the offending chunk.
        received: u64,
    },

    /// A second binary header arrived for an id whose transfer is incomplete.
    #[error("transfer {id} already in progress")]
    TransferInProgress {
        /// Transfer id.
        id: i64,
    },

    /// The request named a table or view that does not exist.
    #[error("unknown {kind} '{name}'")]
    UnknownTarget {
        /// Table or view.
        kind: TargetKind,
        /// Name that failed to resolve.
        name: String,
    },

    /// The method selector is not part of the target's surface.
    #[error("unknown {kind} method '{method}'")]
    UnknownMethod {
        /// Table or view.
        kind: TargetKind,
        /// Method name.
        method: String,
    },

    /// The arguments did not match the method's signature.
    #[error("invalid arguments for '{method}': {message}")]
    InvalidArguments {
        /// Method name.
        method: String,
        /// What was wrong.
        message: String,
    },

    /// The request reached a session that is closing or closed.
    #[error("session closed")]
    SessionClosed,

    /// A reply without a binary tail does not fit in one frame.
    #[error("reply of {size} bytes exceeds the frame limit of {max} bytes")]
    ReplyTooLarge {
        /// Encoded frame size.
        size: usize,
        /// Configured limit.
        max: usize,
    },
}

/// Errors raised by the table engine while executing a method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    /// Column is not part of the schema.
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    /// A value does not match its column type.
    #[error("column '{column}' expects {expected}, got {value}")]
    TypeMismatch {
        /// Column name.
        column: String,
        /// Expected type name.
        expected: String,
        /// Offending value, JSON encoded.
        value: String,
    },

    /// An indexed table received a row without an index value.
    #[error("row is missing index column '{0}'")]
    MissingIndexValue(String),

    /// Operation requires a primary index.
    #[error("table has no index")]
    NoIndex,

    /// Port id was never allocated.
    #[error("unknown port {0}")]
    UnknownPort(u32),

    /// Table cannot be deleted while views depend on it.
    #[error("table '{table}' has {views} dependent view(s)")]
    HasDependentViews {
        /// Table name.
        table: String,
        /// Number of live views.
        views: usize,
    },

    /// Name already in use.
    #[error("'{0}' already exists")]
    AlreadyExists(String),

    /// The view belongs to another session (or to the host).
    #[error("view '{0}' is not owned by this session")]
    NotOwner(String),

    /// The server is locked; hosted tables are read-only for clients.
    #[error("server is locked; tables are read-only")]
    Locked,

    /// The data payload could not be interpreted.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Feature outside the reference engine.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Errors observed by a client awaiting a reply.
///
/// `Clone` so a single disconnect reason can resolve every pending call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The connection closed before the reply arrived.
    #[error("disconnected: {reason}")]
    Disconnected {
        /// Why the connection went away.
        reason: String,
    },

    /// The server-side method raised.
    #[error("{message}")]
    Method {
        /// Human-readable message from the server.
        message: String,
    },

    /// The caller-side timeout elapsed.
    #[error("request timed out")]
    Timeout,

    /// The reply violated the protocol.
    #[error("protocol error: {message}")]
    Protocol {
        /// Details.
        message: String,
    },

    /// Writing to the transport failed.
    #[error("I/O error: {message}")]
    Io {
        /// Details.
        message: String,
    },

    /// A reply payload could not be decoded into the requested type.
    #[error("codec error: {message}")]
    Codec {
        /// Details.
        message: String,
    },
}

impl ClientError {
    pub(crate) fn disconnected(reason: impl Into<String>) -> Self {
        ClientError::Disconnected {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        ClientError::Protocol {
            message: err.to_string(),
        }
    }
}

/// Failure of a dispatched method: either the request was malformed or the
/// engine refused it. Both become an error reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MethodError {
    /// Request did not resolve to a valid call.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Engine raised.
    #[error(transparent)]
    Table(#[from] TableError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_recoverability() {
        assert!(WireError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_recoverable());
        assert!(WireError::UnknownOpcode { opcode: 9 }.is_recoverable());
        assert!(!WireError::InvalidLength { length: 3 }.is_recoverable());
    }

    #[test]
    fn test_method_error_display_is_transparent() {
        let err: MethodError = TableError::NoIndex.into();
        assert_eq!(err.to_string(), "table has no index");

        let err: MethodError = ProtocolError::UnknownTarget {
            kind: TargetKind::View,
            name: "v1".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "unknown view 'v1'");
    }

    #[test]
    fn test_client_error_from_io() {
        let err: ClientError = std::io::Error::other("broken pipe").into();
        assert_eq!(
            err,
            ClientError::Io {
                message: "broken pipe".to_string()
            }
        );
    }
}
