//! Per-connection serving loop.
//!
//! Frames are dispatched to the session in arrival order. Replies without a
//! payload are written inline; binary replies are sent from their own task so
//! a large transfer never stalls the read side. Pushes are written by a
//! dedicated task draining the session's notification channel. All writers
//! share one [`WriteSerializer`].
//!
//! A reply too large for one frame is answered with an error reply for its
//! id instead. The loop also ends when the session is closed from the host
//! side, so the peer sees the connection close.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc;

use crate::rpc::reader::FrameReader;
use crate::rpc::reassembler::ChunkReassembler;
use crate::rpc::writer::WriteSerializer;
use crate::server::session::{Outgoing, Session};
use crate::error::ProtocolError;
use crate::server::Server;
use crate::table::callback::{ClientId, Notification};
use crate::wire::envelope::Request;
use crate::wire::{ChunkFragment, Frame, FRAME_HEADER_SIZE};

type Writer<S> = Arc<WriteSerializer<WriteHalf<S>>>;

pub(crate) async fn run<S>(server: Server, stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = server.config().clone();
    let (read_half, write_half) = tokio::io::split(stream);
    let writer: Writer<S> = Arc::new(WriteSerializer::new(
        write_half,
        config.effective_chunk_size(),
        config.max_frame_size,
    ));

    let (session, push_rx) = server.new_session();
    let client_id = session.client_id();
    let push_task = tokio::spawn(push_loop(Arc::clone(&writer), push_rx, client_id));

    let mut reader = FrameReader::new(read_half, config.read_buffer_size, config.max_frame_size);
    let mut transfers: ChunkReassembler<Request> = ChunkReassembler::new();

    let result = loop {
        let read = tokio::select! {
            read = reader.next_frame() => read,
            () = session.closed() => {
                tracing::info!(%client_id, "session closed by host, dropping connection");
                break Ok(());
            }
        };
        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let outgoing = match frame {
            Frame::Header(json) => accept_header(&session, &mut transfers, &json),
            Frame::Chunk(chunk) => accept_chunk(&session, &mut transfers, chunk),
        };
        let Some(outgoing) = outgoing else {
            continue;
        };

        if outgoing.payload.is_some() {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move {
                let id = outgoing.response.id;
                if let Err(e) = writer.send(outgoing.response, outgoing.payload).await {
                    tracing::debug!(%client_id, id, error = %e, "binary reply not sent");
                }
            });
        } else {
            let outgoing = fit_to_frame(outgoing, config.max_frame_size, client_id);
            if let Err(e) = writer.send(outgoing.response, None).await {
                break Err(e);
            }
        }
    };

    session.close();
    let incomplete = transfers.discard_all();
    if !incomplete.is_empty() {
        tracing::debug!(%client_id, ?incomplete, "discarding incomplete transfers");
    }
    push_task.abort();
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(%client_id, error = %e, "shutdown after close");
    }

    match &result {
        Ok(()) => tracing::info!(
            %client_id,
            frames_read = reader.frames_read(),
            frames_dropped = reader.frames_dropped(),
            frames_written = writer.frames_written(),
            "connection closed"
        ),
        Err(e) => tracing::warn!(%client_id, error = %e, "connection failed"),
    }
    result
}

/// Swap a reply whose header frame would exceed `max_frame_size` for an
/// error reply carrying the same id.
fn fit_to_frame(outgoing: Outgoing, max_frame_size: usize, client_id: ClientId) -> Outgoing {
    let size = match serde_json::to_vec(&outgoing.response) {
        Ok(json) => FRAME_HEADER_SIZE + json.len(),
        // Left for the writer to report.
        Err(_) => return outgoing,
    };
    if size <= max_frame_size {
        return outgoing;
    }
    let id = outgoing.response.id;
    let error = ProtocolError::ReplyTooLarge {
        size,
        max: max_frame_size,
    };
    tracing::warn!(%client_id, id, error = %error, "reply does not fit in a frame");
    Outgoing::error(id, error)
}

fn accept_header(
    session: &Session,
    transfers: &mut ChunkReassembler<Request>,
    json: &Bytes,
) -> Option<Outgoing> {
    let request: Request = match serde_json::from_slice(json) {
        Ok(request) => request,
        Err(e) => return session.reject_malformed(json, &e.to_string()),
    };
    if !request.is_binary {
        return session.handle_request(request, None);
    }

    let id = request.id;
    let declared = request.byte_length.unwrap_or(0);
    if let Err(e) = transfers.begin(id, declared, request) {
        tracing::warn!(client_id = %session.client_id(), id, error = %e, "binary header rejected");
        return (id >= 0).then(|| Outgoing::error(id, e));
    }
    // A zero-length payload needs no chunks.
    let (request, payload) = transfers.take(id)?;
    session.handle_request(request, Some(payload))
}

fn accept_chunk(
    session: &Session,
    transfers: &mut ChunkReassembler<Request>,
    chunk: ChunkFragment,
) -> Option<Outgoing> {
    let id = chunk.id;
    match transfers.append(id, chunk.offset, &chunk.bytes) {
        Ok(true) => {
            let (request, payload) = transfers.take(id)?;
            session.handle_request(request, Some(payload))
        }
        Ok(false) => None,
        Err(e) => {
            tracing::warn!(client_id = %session.client_id(), id, error = %e, "dropping transfer");
            // Only an existing transfer has a caller to answer.
            transfers.discard(id)?;
            (id >= 0).then(|| Outgoing::error(id, e))
        }
    }
}

async fn push_loop<W>(
    writer: Arc<WriteSerializer<W>>,
    mut rx: mpsc::UnboundedReceiver<Notification>,
    client_id: ClientId,
) where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(notification) = rx.recv().await {
        let outgoing = Outgoing::push(notification);
        let id = outgoing.response.id;
        if let Err(e) = writer.send(outgoing.response, outgoing.payload).await {
            tracing::debug!(%client_id, id, error = %e, "push not delivered, stopping");
            break;
        }
    }
}
