//! Shared harness: a real `Server` and `Client` joined by an in-memory pipe,
//! plus a raw frame-level peer for tests that need to control the wire.

#![allow(dead_code)]

use std::io;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tablemux::rpc::reader::FrameReader;
use tablemux::wire::{chunk_frames, encode_frame, Frame, MAX_FRAME_SIZE};
use tablemux::{Client, ClientConfig, Request, Response, Server, ServerConfig, TableData};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

pub const PIPE_CAPACITY: usize = 64 * 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn data(value: Value) -> TableData {
    serde_json::from_value(value).expect("table data")
}

/// Server with one indexed table `t` holding three rows.
pub fn server_with_table() -> Server {
    let server = Server::new(ServerConfig::local());
    server
        .create_table(
            "t",
            data(serde_json::json!({"id": [1, 2, 3], "name": ["a", "b", "c"]})),
            Some("id".to_string()),
        )
        .expect("table");
    server
}

/// Serve one end of a pipe; return the other end.
pub fn serve_pipe(server: &Server) -> (DuplexStream, JoinHandle<io::Result<()>>) {
    let (client_io, server_io) = tokio::io::duplex(PIPE_CAPACITY);
    let server = server.clone();
    let conn = tokio::spawn(async move { server.serve_connection(server_io).await });
    (client_io, conn)
}

pub async fn connect(server: &Server) -> (Client, JoinHandle<io::Result<()>>) {
    connect_with(server, ClientConfig::local()).await
}

pub async fn connect_with(
    server: &Server,
    config: ClientConfig,
) -> (Client, JoinHandle<io::Result<()>>) {
    let (io, conn) = serve_pipe(server);
    let client = Client::connect(io, config).await.expect("connect");
    (client, conn)
}

/// Poll `condition` until it holds, failing after a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Frame-level peer speaking the wire format directly.
pub struct RawPeer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl RawPeer {
    pub fn new(stream: DuplexStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read_half, 4096, MAX_FRAME_SIZE),
            writer: write_half,
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) {
        let bytes = encode_frame(frame, MAX_FRAME_SIZE).expect("encode");
        self.writer.write_all(&bytes).await.expect("write");
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
    }

    pub async fn send<T: Serialize>(&mut self, envelope: &T) {
        self.write_frame(&Frame::header(envelope).expect("header"))
            .await;
    }

    /// Chunk frames for `payload`, in order.
    pub fn chunks(id: i64, payload: &[u8], chunk_size: usize) -> Vec<Frame> {
        chunk_frames(id, &Bytes::copy_from_slice(payload), chunk_size)
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(5), self.reader.next_frame())
            .await
            .expect("frame in time")
            .expect("read")
    }

    pub async fn next_request(&mut self) -> Request {
        match self.next_frame().await {
            Some(Frame::Header(json)) => serde_json::from_slice(&json).expect("request"),
            other => panic!("expected a request header, got {other:?}"),
        }
    }

    pub async fn next_response(&mut self) -> Response {
        match self.next_frame().await {
            Some(Frame::Header(json)) => serde_json::from_slice(&json).expect("response"),
            other => panic!("expected a response header, got {other:?}"),
        }
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}
