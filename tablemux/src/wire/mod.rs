//! Wire format for frame serialization.
//!
//! Frame format: `[length:4][checksum:4][opcode:1][body:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of (opcode + body) for integrity verification
//! - **opcode**: [`Opcode::Header`] or [`Opcode::Chunk`]
//! - **body**: a UTF-8 JSON envelope for headers, or
//!   `[id:8][offset:8][bytes]` (little-endian) for chunks
//!
//! The opcode is what lets a reader tell a structured header from a raw chunk
//! of a binary transfer using only the first bytes of the frame, over a
//! transport that carries no text/binary distinction of its own.

pub mod envelope;

use bytes::Bytes;
use serde::Serialize;

pub use crate::error::WireError;

/// Header size: 4 (length) + 4 (checksum) + 1 (opcode) = 9 bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Fixed prefix of a chunk body: 8 (id) + 8 (offset) = 16 bytes.
pub const CHUNK_PREFIX_SIZE: usize = 16;

/// Default maximum frame size (16MB).
///
/// Frames larger than this are rejected to prevent memory exhaustion attacks.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame discriminator, the first byte after the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Structured JSON envelope.
    Header = 0x01,
    /// Raw slice of a binary transfer.
    Chunk = 0x02,
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Opcode::Header),
            0x02 => Ok(Opcode::Chunk),
            opcode => Err(WireError::UnknownOpcode { opcode }),
        }
    }
}

/// A slice of a binary transfer, tagged with the id of the header it continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFragment {
    /// Correlation id shared with the binary header.
    pub id: i64,
    /// Byte offset of this slice within the transfer.
    pub offset: u64,
    /// Slice contents.
    pub bytes: Bytes,
}

/// One unit of transmission on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON-encoded envelope.
    Header(Bytes),
    /// Continuation of a binary transfer.
    Chunk(ChunkFragment),
}

impl Frame {
    /// Build a header frame from any serializable envelope.
    pub fn header<T: Serialize>(envelope: &T) -> Result<Self, serde_json::Error> {
        Ok(Frame::Header(Bytes::from(serde_json::to_vec(envelope)?)))
    }

    /// Opcode this frame is written with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::Header(_) => Opcode::Header,
            Frame::Chunk(_) => Opcode::Chunk,
        }
    }

    /// Length of the body (everything after the opcode).
    pub fn body_len(&self) -> usize {
        match self {
            Frame::Header(json) => json.len(),
            Frame::Chunk(chunk) => CHUNK_PREFIX_SIZE + chunk.bytes.len(),
        }
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.body_len()
    }
}

/// Split a binary payload into chunk frames of at most `chunk_size` bytes.
///
/// Slices share the payload's allocation. An empty payload yields no chunks.
pub fn chunk_frames(id: i64, payload: &Bytes, chunk_size: usize) -> Vec<Frame> {
    let chunk_size = chunk_size.max(1);
    (0..payload.len())
        .step_by(chunk_size)
        .map(|start| {
            let end = (start + chunk_size).min(payload.len());
            Frame::Chunk(ChunkFragment {
                id,
                offset: start as u64,
                bytes: payload.slice(start..end),
            })
        })
        .collect()
}

/// Compute CRC32C checksum over opcode + body.
fn compute_checksum(opcode: u8, body: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(&[opcode]), body)
}

/// Serialize a frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the encoded frame would exceed `max_frame_size`.
pub fn encode_frame(frame: &Frame, max_frame_size: usize) -> Result<Vec<u8>, WireError> {
    let total_length = frame.encoded_len();
    if total_length > max_frame_size || total_length > u32::MAX as usize {
        return Err(WireError::FrameTooLarge {
            size: total_length,
            max: max_frame_size,
        });
    }

    let mut data = Vec::with_capacity(total_length);
    data.extend_from_slice(&(total_length as u32).to_le_bytes());
    data.extend_from_slice(&[0u8; 4]);
    data.push(frame.opcode() as u8);
    match frame {
        Frame::Header(json) => data.extend_from_slice(json),
        Frame::Chunk(chunk) => {
            data.extend_from_slice(&chunk.id.to_le_bytes());
            data.extend_from_slice(&chunk.offset.to_le_bytes());
            data.extend_from_slice(&chunk.bytes);
        }
    }

    let checksum = compute_checksum(data[8], &data[FRAME_HEADER_SIZE..]);
    data[4..8].copy_from_slice(&checksum.to_le_bytes());

    Ok(data)
}

/// Read the length field of a buffered frame, validating it against the limit.
///
/// Returns `Ok(None)` when fewer than four bytes are buffered.
///
/// # Errors
///
/// Returns `InvalidLength` if the length is smaller than the fixed header or
/// larger than `max_frame_size`. Such a stream cannot be resynchronised.
pub fn peek_frame_length(data: &[u8], max_frame_size: usize) -> Result<Option<usize>, WireError> {
    if data.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if (length as usize) < FRAME_HEADER_SIZE || length as usize > max_frame_size {
        return Err(WireError::InvalidLength { length });
    }
    Ok(Some(length as usize))
}

/// Deserialize exactly one complete frame.
///
/// # Errors
///
/// - `InsufficientData`: Not enough bytes to parse header or full frame
/// - `InvalidLength`: Length field is malformed
/// - `ChecksumMismatch`: Data was corrupted
/// - `UnknownOpcode` / `MalformedChunk`: Body does not match any frame kind
pub fn decode_frame(data: &[u8], max_frame_size: usize) -> Result<Frame, WireError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(WireError::InsufficientData {
            needed: FRAME_HEADER_SIZE,
            have: data.len(),
        });
    }
    match try_decode_frame(data, max_frame_size)? {
        Some((frame, _)) => Ok(frame),
        None => Err(WireError::InsufficientData {
            needed: peek_frame_length(data, max_frame_size)?.unwrap_or(FRAME_HEADER_SIZE),
            have: data.len(),
        }),
    }
}

/// Try to deserialize from a buffer that may contain partial data.
///
/// This is useful for streaming scenarios where frames arrive incrementally.
///
/// # Returns
///
/// - `Ok(Some((frame, consumed)))` if a complete frame was parsed
/// - `Ok(None)` if more data is needed (not an error condition)
/// - `Err` if data is malformed. When [`WireError::is_recoverable`] holds, the
///   whole frame is buffered and [`peek_frame_length`] says how much to skip.
pub fn try_decode_frame(
    data: &[u8],
    max_frame_size: usize,
) -> Result<Option<(Frame, usize)>, WireError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Ok(None); // Need more data for header
    }

    let Some(expected_len) = peek_frame_length(data, max_frame_size)? else {
        return Ok(None);
    };
    if data.len() < expected_len {
        return Ok(None); // Need more data for body
    }

    let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let opcode = data[8];
    let body = &data[FRAME_HEADER_SIZE..expected_len];

    let computed = compute_checksum(opcode, body);
    if computed != checksum {
        return Err(WireError::ChecksumMismatch {
            expected: checksum,
            actual: computed,
        });
    }

    let frame = match Opcode::try_from(opcode)? {
        Opcode::Header => Frame::Header(Bytes::copy_from_slice(body)),
        Opcode::Chunk => {
            if body.len() < CHUNK_PREFIX_SIZE {
                return Err(WireError::MalformedChunk { len: body.len() });
            }
            let mut id = [0u8; 8];
            id.copy_from_slice(&body[0..8]);
            let mut offset = [0u8; 8];
            offset.copy_from_slice(&body[8..16]);
            Frame::Chunk(ChunkFragment {
                id: i64::from_le_bytes(id),
                offset: u64::from_le_bytes(offset),
                bytes: Bytes::copy_from_slice(&body[CHUNK_PREFIX_SIZE..]),
            })
        }
    };

    Ok(Some((frame, expected_len)))
}
