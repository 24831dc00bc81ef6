//! Reassembly of binary transfers split across chunk frames.
//!
//! Transfers are keyed by correlation id, so chunks of different ids may
//! interleave freely with each other and with unrelated header frames. Within
//! one id, chunks must arrive in offset order.
//!
//! ```text
//!   H(7, binary, 10)  C(7, 0, 4)  H(8, reply)  C(7, 4, 4)  C(7, 8, 2)
//!        begin           append     untouched    append      append → complete
//! ```

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;

/// Upper bound on the buffer reserved up front from a declared length.
const MAX_PREALLOCATION: u64 = 1024 * 1024;

struct Transfer<H> {
    header: H,
    declared: u64,
    buffer: BytesMut,
}

impl<H> Transfer<H> {
    fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn is_complete(&self) -> bool {
        self.received() == self.declared
    }
}

/// In-progress binary transfers of one connection, each carrying the header
/// envelope `H` that announced it.
pub struct ChunkReassembler<H> {
    transfers: HashMap<i64, Transfer<H>>,
}

impl<H> Default for ChunkReassembler<H> {
    fn default() -> Self {
        Self {
            transfers: HashMap::new(),
        }
    }
}

impl<H> ChunkReassembler<H> {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transfer announced by `header`.
    ///
    /// A zero-length transfer is complete immediately.
    ///
    /// # Errors
    ///
    /// Returns `TransferInProgress` if `id` already has an incomplete transfer.
    pub fn begin(&mut self, id: i64, declared_length: u64, header: H) -> Result<(), ProtocolError> {
        if self.transfers.get(&id).is_some_and(|t| !t.is_complete()) {
            return Err(ProtocolError::TransferInProgress { id });
        }
        let capacity = declared_length.min(MAX_PREALLOCATION) as usize;
        self.transfers.insert(
            id,
            Transfer {
                header,
                declared: declared_length,
                buffer: BytesMut::with_capacity(capacity),
            },
        );
        Ok(())
    }

    /// Append one chunk; returns whether the transfer is now complete.
    ///
    /// # Errors
    ///
    /// - `UnknownTransfer`: no transfer was begun for `id`
    /// - `OutOfOrderChunk`: `offset` is not the next expected offset
    /// - `ChunkOverflow`: the chunk runs past the declared length
    ///
    /// The transfer is left as it was on error; the caller decides whether to
    /// [`discard`](Self::discard) it.
    pub fn append(&mut self, id: i64, offset: u64, bytes: &[u8]) -> Result<bool, ProtocolError> {
        let transfer = self
            .transfers
            .get_mut(&id)
            .ok_or(ProtocolError::UnknownTransfer { id })?;

        let expected = transfer.received();
        if offset != expected {
            return Err(ProtocolError::OutOfOrderChunk {
                id,
                expected,
                actual: offset,
            });
        }
        let received = expected + bytes.len() as u64;
        if received > transfer.declared {
            return Err(ProtocolError::ChunkOverflow {
                id,
                declared: transfer.declared,
                received,
            });
        }

        transfer.buffer.extend_from_slice(bytes);
        Ok(transfer.is_complete())
    }

    /// Whether every declared byte of `id` has arrived.
    pub fn is_complete(&self, id: i64) -> bool {
        self.transfers.get(&id).is_some_and(Transfer::is_complete)
    }

    /// Remove a complete transfer, returning its header and payload.
    ///
    /// Returns `None` (and keeps the transfer) if it is still incomplete.
    pub fn take(&mut self, id: i64) -> Option<(H, Bytes)> {
        if !self.is_complete(id) {
            return None;
        }
        let transfer = self.transfers.remove(&id)?;
        Some((transfer.header, transfer.buffer.freeze()))
    }

    /// Drop a transfer regardless of progress.
    pub fn discard(&mut self, id: i64) -> Option<H> {
        self.transfers.remove(&id).map(|t| t.header)
    }

    /// Drop every transfer, returning the ids that were still incomplete.
    pub fn discard_all(&mut self) -> Vec<i64> {
        let mut incomplete: Vec<i64> = self
            .transfers
            .drain()
            .filter(|(_, t)| !t.is_complete())
            .map(|(id, _)| id)
            .collect();
        incomplete.sort_unstable();
        incomplete
    }

    /// Number of transfers held.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether no transfer is held.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_transfer() {
        let mut r = ChunkReassembler::new();
        r.begin(1, 6, "header").expect("begin");

        assert_eq!(r.append(1, 0, b"abc"), Ok(false));
        assert!(!r.is_complete(1));
        assert!(r.take(1).is_none());
        assert_eq!(r.append(1, 3, b"def"), Ok(true));

        let (header, payload) = r.take(1).expect("complete");
        assert_eq!(header, "header");
        assert_eq!(&payload[..], b"abcdef");
        assert!(r.is_empty());
    }

    #[test]
    fn test_interleaved_ids() {
        let mut r = ChunkReassembler::new();
        r.begin(1, 4, 'a').expect("begin");
        r.begin(2, 2, 'b').expect("begin");

        assert_eq!(r.append(1, 0, b"12"), Ok(false));
        assert_eq!(r.append(2, 0, b"xy"), Ok(true));
        assert_eq!(r.take(2).map(|(_, p)| p), Some(Bytes::from_static(b"xy")));
        assert_eq!(r.append(1, 2, b"34"), Ok(true));
        assert_eq!(r.take(1).map(|(_, p)| p), Some(Bytes::from_static(b"1234")));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut r = ChunkReassembler::new();
        r.begin(5, 8, ()).expect("begin");
        r.append(5, 0, b"aaaa").expect("first chunk");

        assert_eq!(
            r.append(5, 6, b"bb"),
            Err(ProtocolError::OutOfOrderChunk {
                id: 5,
                expected: 4,
                actual: 6
            })
        );
        // A duplicate of the first chunk is just as out of order.
        assert!(matches!(
            r.append(5, 0, b"aaaa"),
            Err(ProtocolError::OutOfOrderChunk { .. })
        ));
    }

    #[test]
    fn test_overflow_rejected() {
        let mut r = ChunkReassembler::new();
        r.begin(1, 2, ()).expect("begin");
        assert_eq!(
            r.append(1, 0, b"abc"),
            Err(ProtocolError::ChunkOverflow {
                id: 1,
                declared: 2,
                received: 3
            })
        );
    }

    #[test]
    fn test_unknown_transfer() {
        let mut r: ChunkReassembler<()> = ChunkReassembler::new();
        assert_eq!(
            r.append(9, 0, b"x"),
            Err(ProtocolError::UnknownTransfer { id: 9 })
        );
    }

    #[test]
    fn test_begin_twice_while_incomplete() {
        let mut r = ChunkReassembler::new();
        r.begin(1, 2, ()).expect("begin");
        assert_eq!(
            r.begin(1, 2, ()),
            Err(ProtocolError::TransferInProgress { id: 1 })
        );
    }

    #[test]
    fn test_zero_length_is_complete() {
        let mut r = ChunkReassembler::new();
        r.begin(3, 0, ()).expect("begin");
        assert!(r.is_complete(3));
        assert_eq!(r.take(3).map(|(_, p)| p.len()), Some(0));
    }

    #[test]
    fn test_discard_all_reports_incomplete() {
        let mut r = ChunkReassembler::new();
        r.begin(4, 10, ()).expect("begin");
        r.begin(2, 10, ()).expect("begin");
        r.begin(3, 0, ()).expect("begin");
        r.append(4, 0, b"half").expect("append");

        assert_eq!(r.discard_all(), vec![2, 4]);
        assert!(r.is_empty());
    }
}
