use std::{
    fmt,
    net::{Shutdown, SocketAddr, TcpStream},
};

use interlink_common::{
    codec::WireCodec,
    envelope::{Answer, Request, MALFORMED_REQUEST_PREFIX, UNDECODABLE_REQUEST_MESSAGE},
    frame_stream::{FrameStream, ReadOutcome},
};
use uuid::Uuid;

use crate::registry::ListenerRegistry;

/// Non-blocking reads performed per tick on one inbound connection
const READS_PER_TICK: usize = 16;

/// Identifies an accepted inbound connection
pub type ConnectionId = Uuid;

/// Server side of one accepted connection.
///
/// The codec is fixed when the connection is accepted; reconfiguring the
/// server later does not change the secret an existing connection uses.
///
/// Intake pauses while more than one frame limit of answers is waiting to be
/// written, so a peer that sends without reading cannot grow the send queue
/// without bound.
pub struct ConnectionHandler {
    id:             ConnectionId,
    peer:           SocketAddr,
    codec:          WireCodec,
    stream:         FrameStream<TcpStream>,
    read_closed:    bool,
    closed:         bool,
    requests_seen:  u64,
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("read_closed", &self.read_closed)
            .field("closed", &self.closed)
            .field("requests_seen", &self.requests_seen)
            .finish()
    }
}

impl ConnectionHandler {
    /// Wraps an accepted, already non-blocking stream
    pub fn new(stream: TcpStream, peer: SocketAddr, codec: WireCodec) -> Self {
        let max_frame_bytes = codec.max_frame_bytes();
        Self {
            id: Uuid::new_v4(),
            peer,
            codec,
            stream: FrameStream::new(stream, max_frame_bytes),
            read_closed: false,
            closed: false,
            requests_seen: 0,
        }
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection is finished and can be dropped
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Requests answered so far
    pub fn requests_seen(&self) -> u64 {
        self.requests_seen
    }

    /// Answer bytes waiting for the peer to read
    pub fn pending_reply_bytes(&self) -> usize {
        self.stream.pending_write_bytes()
    }

    fn backlogged(&self) -> bool {
        self.stream.pending_write_bytes() > self.codec.max_frame_bytes()
    }

    /// One non-blocking pass: flush queued answers, read what is available
    /// and answer complete requests in arrival order.
    ///
    /// After the peer half-closes, requests already received are still
    /// answered and flushed; the connection closes once nothing is left.
    pub fn poll(&mut self, registry: &ListenerRegistry) {
        if self.closed {
            return;
        }

        if let Err(e) = self.stream.flush_pending() {
            tracing::warn!(connection = %self.id, peer = %self.peer, "Write failed: {}", e);
            self.close();
            return;
        }

        if !self.read_closed && !self.backlogged() {
            match self.stream.fill(READS_PER_TICK) {
                Ok(ReadOutcome::Open(_)) => {}
                Ok(ReadOutcome::Eof(_)) => {
                    tracing::debug!(connection = %self.id, peer = %self.peer, "Peer finished sending");
                    self.read_closed = true;
                }
                Err(e) => {
                    tracing::warn!(connection = %self.id, peer = %self.peer, "Read failed: {}", e);
                    self.close();
                    return;
                }
            }
        }

        let mut drained = false;
        while !self.backlogged() {
            match self.stream.next_frame() {
                Ok(Some(payload)) => {
                    let answer = answer_request(&self.codec, registry, &payload);
                    self.requests_seen += 1;
                    self.reply(&answer);
                    if self.closed {
                        return;
                    }
                }
                Ok(None) => {
                    drained = true;
                    break;
                }
                Err(e) => {
                    // the stream position is lost, nothing after this can be framed
                    tracing::warn!(
                        connection = %self.id,
                        peer = %self.peer,
                        "Unreadable frame header, closing: {}",
                        e
                    );
                    self.close();
                    return;
                }
            }
        }

        if self.read_closed && drained && self.stream.pending_write_bytes() == 0 {
            tracing::info!(
                connection = %self.id,
                peer = %self.peer,
                requests = self.requests_seen,
                "Peer disconnected"
            );
            self.close();
        }
    }

    fn reply(&mut self, answer: &Answer) {
        let frame = match self.codec.encode(answer) {
            Ok(frame) => frame,
            Err(e) => {
                // every request still gets exactly one answer
                tracing::warn!(connection = %self.id, "Answer could not be encoded: {}", e);
                match self.codec.encode(&Answer::error(format!("Answer could not be encoded: {e}"))) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(connection = %self.id, "Error answer could not be encoded: {}", e);
                        self.close();
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.stream.send_frame(&frame) {
            tracing::warn!(connection = %self.id, peer = %self.peer, "Write failed: {}", e);
            self.close();
        }
    }

    /// Shuts the socket down. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            let _ = self.stream.get_ref().shutdown(Shutdown::Both);
            self.closed = true;
            tracing::debug!(connection = %self.id, requests = self.requests_seen, "Connection closed");
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.close();
    }
}

/// Turns one request payload into its answer.
///
/// Decoding and validation failures become error answers so the caller's
/// answer queue stays aligned.
pub fn answer_request(codec: &WireCodec, registry: &ListenerRegistry, payload: &[u8]) -> Answer {
    let value = match codec.decode_value(payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!("Undecodable request: {}", e);
            return Answer::error(UNDECODABLE_REQUEST_MESSAGE);
        }
    };

    let request = match Request::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("Malformed request: {}", e);
            return Answer::error(format!("{MALFORMED_REQUEST_PREFIX}: {e}"));
        }
    };

    tracing::trace!(method = %request.method, "Dispatching request");
    registry
        .trigger(&request.method, request.data)
        .unwrap_or_else(Answer::no_listener)
}
