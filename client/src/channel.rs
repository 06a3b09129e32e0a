use std::{
    cell::Cell,
    io,
    net::{Shutdown, TcpStream},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, TryRecvError};
use interlink_common::{
    codec::{CipherScheme, LegacyIv, Secret, WireCodec},
    config::{CommConfig, PeerAddress, DEFAULT_CONNECT_TIMEOUT_MS},
    envelope::{Answer, Request, UNDECODABLE_ANSWER_MESSAGE},
    error::{ConnectError, EncodeError},
    frame_stream::{FrameStream, ReadOutcome, DEFAULT_MAX_FRAME_BYTES},
    platform_socket::connect_socket,
};
use serde_json::Value;
use thiserror::Error;

use crate::pending::{AnswerCallback, PendingCalls, Resolution};

/// Non-blocking reads performed per tick
const READS_PER_TICK: usize = 1;

/// Configuration for an outbound channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Secret shared with the peer
    pub secret:          Secret,
    /// Cipher scheme the peer expects
    pub scheme:          CipherScheme,
    /// Fixed IV when the peer speaks the legacy scheme
    pub legacy_iv:       LegacyIv,
    /// Bound on the blocking connect
    pub connect_timeout: Duration,
    /// Largest accepted answer frame
    pub max_frame_bytes: usize,
}

impl ChannelConfig {
    /// Creates a channel configuration with default values
    pub fn new<S: Into<Secret>>(secret: S) -> Self {
        Self {
            secret:          secret.into(),
            scheme:          CipherScheme::default(),
            legacy_iv:       LegacyIv::default(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Takes scheme, legacy IV, connect timeout and frame limit from the
    /// host configuration, with a peer-specific secret
    pub fn from_comm<S: Into<Secret>>(config: &CommConfig, secret: S) -> Self {
        Self {
            secret:          secret.into(),
            scheme:          config.scheme,
            legacy_iv:       config.legacy_iv,
            connect_timeout: config.connect_timeout(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    /// Set the cipher scheme
    pub fn with_scheme(mut self, scheme: CipherScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Set the legacy scheme IV
    pub fn with_legacy_iv(mut self, legacy_iv: LegacyIv) -> Self {
        self.legacy_iv = legacy_iv;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the frame size limit
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    fn codec(&self) -> WireCodec {
        WireCodec::new(&self.secret, self.scheme)
            .with_legacy_iv(self.legacy_iv)
            .with_max_frame_bytes(self.max_frame_bytes)
    }
}

/// Why a call could not be issued
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel was closed, explicitly or by the peer
    #[error("channel is closed")]
    Closed,
    /// The peer is not reading; more than one frame limit of requests is
    /// still waiting to be written. Nothing was queued.
    #[error("peer is not reading, {queued} bytes still unsent")]
    Backlogged {
        /// Bytes waiting in the send queue
        queued: usize,
    },
    /// The request could not be encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// Writing the request failed; the channel is now closed
    #[error("failed to write request: {0}")]
    Io(#[from] io::Error),
}

/// Client side of one persistent connection to a peer controller.
///
/// Calls never block: requests are written (or queued for the next tick) and
/// each answer is delivered to its callback from [`OutboundChannel::tick`],
/// strictly in call order.
pub struct OutboundChannel {
    peer:       PeerAddress,
    codec:      WireCodec,
    stream:     Option<FrameStream<TcpStream>>,
    pending:    PendingCalls,
    calls_sent: u64,
}

impl OutboundChannel {
    /// Connects with default settings and the given secret
    pub fn connect<S: Into<Secret>>(peer: PeerAddress, secret: S) -> Result<Self, ConnectError> {
        Self::connect_with(peer, &ChannelConfig::new(secret))
    }

    /// Connects to `peer` and switches the socket to non-blocking mode.
    /// Failures are reported here and never retried.
    pub fn connect_with(peer: PeerAddress, config: &ChannelConfig) -> Result<Self, ConnectError> {
        let socket = connect_socket(&peer, config.connect_timeout).inspect_err(|e| {
            tracing::warn!("Outbound connect failed: {}", e);
        })?;

        tracing::info!(
            peer = %peer,
            scheme = %config.scheme,
            secret = %config.secret.fingerprint(),
            "Outbound channel connected"
        );

        Ok(Self {
            peer,
            codec: config.codec(),
            stream: Some(FrameStream::new(socket, config.max_frame_bytes)),
            pending: PendingCalls::new(),
            calls_sent: 0,
        })
    }

    /// Peer this channel talks to
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    /// Whether the socket is still usable
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Calls written but not yet answered
    pub fn pending_calls(&self) -> usize {
        self.pending.in_flight()
    }

    /// Issues a call; `on_result` runs from a later [`OutboundChannel::tick`]
    /// once the matching answer arrives. There is no implicit timeout.
    pub fn call<F>(&mut self, on_result: F, method: &str, data: Value) -> Result<(), ChannelError>
    where
        F: FnOnce(Answer) + 'static,
    {
        self.enqueue(Box::new(on_result), method, data, None)
    }

    /// Like [`OutboundChannel::call`], but `on_result` receives a timeout
    /// error answer if no answer arrived within `timeout`. A late answer is
    /// still consumed in order and then dropped.
    pub fn call_with_timeout<F>(
        &mut self,
        on_result: F,
        method: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<(), ChannelError>
    where
        F: FnOnce(Answer) + 'static,
    {
        let deadline = Instant::now() + timeout;
        self.enqueue(Box::new(on_result), method, data, Some(deadline))
    }

    /// Issues a call and returns a handle that yields the answer once a tick
    /// delivers it
    pub fn call_pending(&mut self, method: &str, data: Value) -> Result<PendingAnswer, ChannelError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.call(
            move |answer| {
                let _ = tx.send(answer);
            },
            method,
            data,
        )?;
        Ok(PendingAnswer {
            rx,
            taken: Cell::new(false),
        })
    }

    fn enqueue(
        &mut self,
        callback: AnswerCallback,
        method: &str,
        data: Value,
        deadline: Option<Instant>,
    ) -> Result<(), ChannelError> {
        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;
        let queued = stream.pending_write_bytes();
        if queued > self.codec.max_frame_bytes() {
            tracing::debug!(peer = %self.peer, method, queued, "Send queue full, call refused");
            return Err(ChannelError::Backlogged { queued });
        }
        let frame = self.codec.encode(&Request::new(method, data))?;

        if let Err(e) = stream.send_frame(&frame) {
            tracing::warn!(peer = %self.peer, method, "Write failed, closing channel: {}", e);
            self.close();
            return Err(ChannelError::Io(e));
        }

        tracing::trace!(peer = %self.peer, method, bytes = frame.len(), "Call sent");
        self.pending.push(method, callback, deadline);
        self.calls_sent += 1;
        Ok(())
    }

    /// One non-blocking pass: expire overdue calls, flush queued requests,
    /// read once and deliver every complete answer in order.
    pub fn tick(&mut self) {
        self.pending.expire(Instant::now());

        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        if let Err(e) = stream.flush_pending() {
            tracing::warn!(peer = %self.peer, "Write failed, closing channel: {}", e);
            self.close();
            return;
        }

        let outcome = match stream.fill(READS_PER_TICK) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(peer = %self.peer, "Read failed, closing channel: {}", e);
                self.close();
                return;
            }
        };

        let mut frames = Vec::new();
        let mut frame_error = None;
        loop {
            match stream.next_frame() {
                Ok(Some(payload)) => frames.push(payload),
                Ok(None) => break,
                Err(e) => {
                    frame_error = Some(e);
                    break;
                }
            }
        }

        for payload in frames {
            self.deliver(&payload);
        }

        if let Some(e) = frame_error {
            tracing::warn!(peer = %self.peer, "Unreadable frame header, closing channel: {}", e);
            self.close();
        } else if let ReadOutcome::Eof(_) = outcome {
            tracing::info!(peer = %self.peer, "Peer closed the channel");
            self.close();
        }
    }

    fn deliver(&mut self, payload: &[u8]) {
        let answer = match self.codec.decode_value(payload).and_then(Answer::from_value) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(peer = %self.peer, "Undecodable answer: {}", e);
                Answer::error(format!("{UNDECODABLE_ANSWER_MESSAGE}: {e}"))
            }
        };

        match self.pending.resolve(answer) {
            Resolution::Delivered { method } => {
                tracing::trace!(peer = %self.peer, method, "Answer delivered");
            }
            Resolution::Late { method } => {
                tracing::debug!(peer = %self.peer, method, "Dropped answer for timed-out call");
            }
            Resolution::Unexpected => {
                tracing::warn!(peer = %self.peer, "Received an answer with no call outstanding");
            }
        }
    }

    /// Closes the socket. Callbacks still queued are dropped without being
    /// invoked. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.get_ref().shutdown(Shutdown::Both);
            let abandoned = self.pending.abandon();
            tracing::info!(peer = %self.peer, abandoned, "Outbound channel closed");
        }
    }

    /// Connection and usage statistics
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            peer:       self.peer.clone(),
            open:       self.is_open(),
            calls_sent: self.calls_sent,
            in_flight:  self.pending.in_flight(),
        }
    }
}

impl Drop for OutboundChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Statistics about an outbound channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    /// Peer the channel was opened to
    pub peer:       PeerAddress,
    /// Whether the socket is still usable
    pub open:       bool,
    /// Calls written since the channel was opened
    pub calls_sent: u64,
    /// Calls still waiting for an answer, timed-out ones included
    pub in_flight:  usize,
}

/// Handle to the answer of a call made with
/// [`OutboundChannel::call_pending`]
#[derive(Debug)]
pub struct PendingAnswer {
    rx:    Receiver<Answer>,
    taken: Cell<bool>,
}

impl PendingAnswer {
    /// The answer, if a tick has delivered it and it was not taken yet
    pub fn try_answer(&self) -> Option<Answer> {
        let answer = self.rx.try_recv().ok();
        if answer.is_some() {
            self.taken.set(true);
        }
        answer
    }

    /// Whether the call can no longer be answered (channel closed first).
    /// Never consumes a delivered answer.
    pub fn is_abandoned(&self) -> bool {
        !self.taken.get()
            && self.rx.is_empty()
            && matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}
