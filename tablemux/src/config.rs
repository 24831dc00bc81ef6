//! Configuration for servers and clients.

use std::time::Duration;

use crate::wire::{CHUNK_PREFIX_SIZE, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};

/// Default size of one binary chunk (64KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default read buffer growth per read call.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

fn clamp_chunk_size(chunk_size: usize, max_frame_size: usize) -> usize {
    let room = max_frame_size.saturating_sub(FRAME_HEADER_SIZE + CHUNK_PREFIX_SIZE);
    chunk_size.clamp(1, room.max(1))
}

/// Configuration of the serving side of a connection.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum bytes carried by one chunk frame.
    pub chunk_size: usize,

    /// Frames above this size are rejected in both directions.
    pub max_frame_size: usize,

    /// Bytes requested from the transport per read.
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    /// Small chunks, so binary transfers interleave with control traffic
    /// even for modest payloads. Handy for local testing.
    pub fn local() -> Self {
        Self {
            chunk_size: 1024,
            max_frame_size: 1024 * 1024,
            read_buffer_size: 4 * 1024,
        }
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the frame size limit.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Chunk size, bounded so a chunk frame fits under `max_frame_size`.
    pub fn effective_chunk_size(&self) -> usize {
        clamp_chunk_size(self.chunk_size, self.max_frame_size)
    }
}

/// Configuration of a [`Client`](crate::rpc::client::Client).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Maximum bytes carried by one chunk frame.
    pub chunk_size: usize,

    /// Frames above this size are rejected in both directions.
    pub max_frame_size: usize,

    /// Bytes requested from the transport per read.
    pub read_buffer_size: usize,

    /// Applied to every call; `None` waits until reply or disconnect.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            request_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Small chunks and a short timeout.
    pub fn local() -> Self {
        Self {
            chunk_size: 1024,
            max_frame_size: 1024 * 1024,
            read_buffer_size: 4 * 1024,
            request_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// Set the per-call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Chunk size, bounded so a chunk frame fits under `max_frame_size`.
    pub fn effective_chunk_size(&self) -> usize {
        clamp_chunk_size(self.chunk_size, self.max_frame_size)
    }
}
