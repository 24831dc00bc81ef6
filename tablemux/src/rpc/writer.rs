//! Serialized writes for one connection.
//!
//! Any number of tasks may produce output for a connection at once (a direct
//! reply racing an unrelated push, two binary transfers in flight). The
//! [`WriteSerializer`] guarantees at most one frame is being written at any
//! instant, so frames never interleave mid-frame on the wire.
//!
//! The lock is taken per frame, not per envelope: a large binary transfer
//! releases it between chunks, letting small replies slip in between. The
//! tokio mutex is fair, so a waiting writer gets the next turn.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};

use crate::wire::envelope::{Request, Response};
use crate::wire::{chunk_frames, encode_frame, Frame};

/// Envelope that can head a binary transfer.
pub trait Envelope: Serialize {
    /// Correlation id shared with the chunks that follow.
    fn id(&self) -> i64;

    /// Mark as the header of a transfer of `byte_length` bytes.
    fn mark_binary(self, byte_length: u64) -> Self;
}

impl Envelope for Request {
    fn id(&self) -> i64 {
        self.id
    }

    fn mark_binary(self, byte_length: u64) -> Self {
        self.with_binary(byte_length)
    }
}

impl Envelope for Response {
    fn id(&self) -> i64 {
        self.id
    }

    fn mark_binary(self, byte_length: u64) -> Self {
        self.with_binary(byte_length)
    }
}

/// Exclusive write access to the connection. Released on drop.
pub struct WriteGuard<'a, W> {
    writer: MutexGuard<'a, W>,
    max_frame_size: usize,
    frames_written: &'a AtomicU64,
}

impl<W: AsyncWrite + Unpin> WriteGuard<'_, W> {
    /// Write one frame.
    ///
    /// # Errors
    ///
    /// `InvalidData` if the frame exceeds the size limit, or the transport's
    /// own error.
    pub async fn write(&mut self, frame: &Frame) -> io::Result<()> {
        let data = encode_frame(frame, self.max_frame_size)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(&data).await?;
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush the transport.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }

    /// Release the connection.
    pub fn release(self) {}
}

/// Single-writer gate around a connection's write half.
pub struct WriteSerializer<W> {
    writer: Mutex<W>,
    chunk_size: usize,
    max_frame_size: usize,
    frames_written: AtomicU64,
}

impl<W: AsyncWrite + Unpin + Send> WriteSerializer<W> {
    /// Wrap a write half. `chunk_size` must already fit under `max_frame_size`.
    pub fn new(writer: W, chunk_size: usize, max_frame_size: usize) -> Self {
        Self {
            writer: Mutex::new(writer),
            chunk_size,
            max_frame_size,
            frames_written: AtomicU64::new(0),
        }
    }

    /// Wait for exclusive access.
    pub async fn acquire(&self) -> WriteGuard<'_, W> {
        WriteGuard {
            writer: self.writer.lock().await,
            max_frame_size: self.max_frame_size,
            frames_written: &self.frames_written,
        }
    }

    /// Write and flush one frame under the lock.
    ///
    /// # Errors
    ///
    /// See [`WriteGuard::write`].
    pub async fn write_frame(&self, frame: &Frame) -> io::Result<()> {
        let mut guard = self.acquire().await;
        guard.write(frame).await?;
        guard.flush().await
    }

    /// Send an envelope, followed by its binary payload in chunk frames.
    ///
    /// # Errors
    ///
    /// Fails if the envelope cannot be serialized, a frame is too large, or
    /// the transport fails. Chunks already written stay written.
    pub async fn send<E: Envelope>(&self, envelope: E, payload: Option<Bytes>) -> io::Result<()> {
        let Some(payload) = payload else {
            let frame = Frame::header(&envelope).map_err(io::Error::other)?;
            return self.write_frame(&frame).await;
        };

        let id = envelope.id();
        let header =
            Frame::header(&envelope.mark_binary(payload.len() as u64)).map_err(io::Error::other)?;
        self.write_frame(&header).await?;
        let chunks = chunk_frames(id, &payload, self.chunk_size);
        tracing::debug!(id, bytes = payload.len(), chunks = chunks.len(), "sending binary transfer");
        for chunk in &chunks {
            self.write_frame(chunk).await?;
        }
        Ok(())
    }

    /// Shut the write half down.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// Configured chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::envelope::PushKind;
    use crate::wire::{try_decode_frame, MAX_FRAME_SIZE};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn decode_all(mut data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some((frame, consumed)) =
            try_decode_frame(data, MAX_FRAME_SIZE).expect("valid stream")
        {
            frames.push(frame);
            data = &data[consumed..];
        }
        assert!(data.is_empty(), "trailing partial frame");
        frames
    }

    #[tokio::test]
    async fn test_send_plain_envelope() {
        let serializer = WriteSerializer::new(Vec::new(), 4, MAX_FRAME_SIZE);
        serializer
            .send(Response::reply(1, json!("ok")), None)
            .await
            .expect("send");

        let buffer = serializer.writer.into_inner();
        let frames = decode_all(&buffer);
        assert_eq!(frames.len(), 1);
        let Frame::Header(json) = &frames[0] else {
            panic!("expected header");
        };
        let parsed: Response = serde_json::from_slice(json).expect("envelope");
        assert_eq!(parsed, Response::reply(1, json!("ok")));
    }

    #[tokio::test]
    async fn test_send_binary_envelope_chunks() {
        let serializer = WriteSerializer::new(Vec::new(), 4, MAX_FRAME_SIZE);
        let payload = Bytes::from_static(b"0123456789");
        serializer
            .send(
                Response::push(7, PushKind::Update, json!({"port_id": 0})),
                Some(payload.clone()),
            )
            .await
            .expect("send");
        assert_eq!(serializer.frames_written(), 4);

        let frames = decode_all(&serializer.writer.into_inner());
        let Frame::Header(json) = &frames[0] else {
            panic!("expected header");
        };
        let header: Response = serde_json::from_slice(json).expect("envelope");
        assert!(header.is_binary);
        assert_eq!(header.byte_length, Some(10));

        let mut rebuilt = Vec::new();
        for frame in &frames[1..] {
            let Frame::Chunk(chunk) = frame else {
                panic!("expected chunk");
            };
            assert_eq!(chunk.id, 7);
            assert_eq!(chunk.offset as usize, rebuilt.len());
            rebuilt.extend_from_slice(&chunk.bytes);
        }
        assert_eq!(rebuilt, payload.to_vec());
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let serializer = WriteSerializer::new(Vec::new(), 4, 32);
        let err = serializer
            .send(Response::reply(1, json!("x".repeat(100))), None)
            .await
            .expect_err("too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(serializer.frames_written(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_split_frames() {
        let (write_half, mut read_half) = tokio::io::duplex(1024);
        let serializer = Arc::new(WriteSerializer::new(write_half, 16, MAX_FRAME_SIZE));

        let mut tasks = tokio::task::JoinSet::new();
        for id in 0..8i64 {
            let serializer = Arc::clone(&serializer);
            tasks.spawn(async move {
                let payload = Bytes::from(vec![id as u8; 100]);
                serializer
                    .send(Response::reply(id, json!(null)), Some(payload))
                    .await
                    .expect("send");
            });
        }
        let reader = tokio::spawn(async move {
            let mut buffer = Vec::new();
            read_half.read_to_end(&mut buffer).await.expect("read");
            buffer
        });
        while let Some(result) = tasks.join_next().await {
            result.expect("writer task");
        }
        serializer.shutdown().await.expect("shutdown");
        drop(serializer);

        let frames = decode_all(&reader.await.expect("reader"));
        // 8 headers + 8 * ceil(100 / 16) chunks, all intact.
        assert_eq!(frames.len(), 8 + 8 * 7);
        for frame in frames {
            if let Frame::Chunk(chunk) = frame {
                assert!(chunk.bytes.iter().all(|b| *b as i64 == chunk.id));
            }
        }
    }
}
