//! Streaming frame reader for one connection.
//!
//! Bytes are buffered until a whole frame is available. A frame with a sane
//! length but a bad checksum, opcode or chunk layout is skipped with a
//! warning; a bad length field leaves no way to find the next boundary and
//! ends the stream with an error.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::wire::{peek_frame_length, try_decode_frame, Frame};

/// Reads [`Frame`]s from a byte stream in arrival order.
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
    read_size: usize,
    max_frame_size: usize,
    frames_read: u64,
    frames_dropped: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a read half.
    pub fn new(reader: R, read_size: usize, max_frame_size: usize) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(read_size),
            read_size: read_size.max(1),
            max_frame_size,
            frames_read: 0,
            frames_dropped: 0,
        }
    }

    /// Next frame; `Ok(None)` at end of stream.
    ///
    /// Bytes of a frame cut off by the end of stream are discarded.
    ///
    /// # Errors
    ///
    /// Transport errors, and `InvalidData` for an unrecoverable length field.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.process_read_buffer()? {
                return Ok(Some(frame));
            }

            let start = self.buffer.len();
            self.buffer.resize(start + self.read_size, 0);
            let n = match self.reader.read(&mut self.buffer[start..]).await {
                Ok(n) => n,
                Err(e) => {
                    self.buffer.truncate(start);
                    return Err(e);
                }
            };
            self.buffer.truncate(start + n);

            if n == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(
                        bytes = self.buffer.len(),
                        "stream ended inside a frame, discarding"
                    );
                    self.buffer.clear();
                }
                return Ok(None);
            }
        }
    }

    /// Pop one complete frame off the buffer, skipping corrupt ones.
    fn process_read_buffer(&mut self) -> io::Result<Option<Frame>> {
        loop {
            match try_decode_frame(&self.buffer, self.max_frame_size) {
                Ok(Some((frame, consumed))) => {
                    self.buffer.drain(..consumed);
                    self.frames_read += 1;
                    return Ok(Some(frame));
                }
                Ok(None) => return Ok(None),
                Err(e) if e.is_recoverable() => {
                    // Recoverable errors are only raised once the whole frame
                    // is buffered, so its length is known.
                    let skip = peek_frame_length(&self.buffer, self.max_frame_size)
                        .ok()
                        .flatten()
                        .unwrap_or(self.buffer.len());
                    tracing::warn!(error = %e, skipped = skip, "dropping malformed frame");
                    self.buffer.drain(..skip);
                    self.frames_dropped += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unrecoverable framing error");
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
            }
        }
    }

    /// Frames successfully decoded.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Malformed frames skipped.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}
