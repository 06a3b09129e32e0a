use std::io::{self, Read, Write};

use crate::error::FrameError;

/// Default cap on a single frame's ciphertext (16 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
/// Longest accepted length line, excluding the newline
pub const MAX_HEADER_BYTES: usize = 20;

const READ_CHUNK: usize = 16 * 1024;

/// Accumulates raw bytes and yields complete frame payloads.
///
/// Tolerates frames split across any number of reads and several frames
/// arriving in one read. Consumed frames only advance a read offset; the
/// consumed prefix is dropped on the next [`FrameBuffer::extend`], so taking
/// every frame out of one large read stays linear.
#[derive(Debug)]
pub struct FrameBuffer {
    buf:             Vec<u8>,
    start:           usize,
    max_frame_bytes: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameBuffer {
    /// Creates an empty buffer
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            max_frame_bytes,
        }
    }

    /// Appends freshly read bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed as frames
    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns the next complete frame payload, or `None` if the
    /// buffer only holds a partial frame.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let pending = &self.buf[self.start..];
        let newline = pending
            .iter()
            .take(MAX_HEADER_BYTES + 1)
            .position(|&b| b == b'\n');

        let Some(newline) = newline else {
            if pending.len() > MAX_HEADER_BYTES {
                return Err(FrameError::HeaderTooLong(MAX_HEADER_BYTES));
            }
            return Ok(None);
        };

        let size = parse_length(&pending[..newline])?;
        if size > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                size,
                max: self.max_frame_bytes,
            });
        }

        let end = newline + 1 + size;
        if pending.len() < end {
            return Ok(None);
        }

        let payload = pending[newline + 1..end].to_vec();
        self.start += end;
        Ok(Some(payload))
    }
}

fn parse_length(header: &[u8]) -> Result<usize, FrameError> {
    let invalid = || FrameError::InvalidLength(String::from_utf8_lossy(header).into_owned());

    if header.is_empty() || !header.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    std::str::from_utf8(header)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)
}

/// Result of polling a stream for input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Stream still open; carries the number of bytes read this poll
    Open(usize),
    /// Peer closed its side; carries the bytes read before end of stream
    Eof(usize),
}

/// Frame-oriented wrapper over a non-blocking byte stream.
///
/// Outgoing frames are buffered until the stream accepts them, so writes never
/// block and frames leave in the order they were queued.
#[derive(Debug)]
pub struct FrameStream<S> {
    stream:   S,
    inbound:  FrameBuffer,
    outbound: Vec<u8>,
}

impl<S: Read + Write> FrameStream<S> {
    /// Wraps a stream that is already in non-blocking mode
    pub fn new(stream: S, max_frame_bytes: usize) -> Self {
        Self {
            stream,
            inbound: FrameBuffer::new(max_frame_bytes),
            outbound: Vec::new(),
        }
    }

    /// Underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Queues an encoded frame and writes as much as the stream accepts
    pub fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.outbound.extend_from_slice(frame);
        self.flush_pending()
    }

    /// Writes queued bytes until the stream would block
    pub fn flush_pending(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Bytes queued but not yet written
    pub fn pending_write_bytes(&self) -> usize {
        self.outbound.len()
    }

    /// Performs up to `max_reads` non-blocking reads into the receive buffer
    pub fn fill(&mut self, max_reads: usize) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;

        for _ in 0..max_reads {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Eof(total)),
                Ok(n) => {
                    self.inbound.extend(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::Open(total))
    }

    /// Next complete frame payload from the receive buffer
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        self.inbound.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::codec::encode_frame;

    /// In-memory stream that serves scripted read chunks and would-block
    /// when the script runs dry.
    #[derive(Default)]
    struct ScriptedStream {
        reads:       VecDeque<Vec<u8>>,
        written:     Vec<u8>,
        write_limit: Option<usize>,
        eof:         bool,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.reads.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.write_limit {
                Some(0) => Err(io::ErrorKind::WouldBlock.into()),
                Some(limit) => {
                    let n = limit.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    self.write_limit = Some(limit - n);
                    Ok(n)
                }
                None => {
                    self.written.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn drain(buffer: &mut FrameBuffer) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = buffer.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn byte_at_a_time_yields_one_frame() {
        let frame = encode_frame(b"0123456789abcdef");
        let mut buffer = FrameBuffer::default();
        let mut frames = Vec::new();

        for byte in &frame {
            buffer.extend(std::slice::from_ref(byte));
            frames.extend(drain(&mut buffer));
        }

        assert_eq!(frames, vec![b"0123456789abcdef".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn two_frames_in_one_read_come_out_in_order() {
        let mut bytes = encode_frame(b"first");
        bytes.extend(encode_frame(b"second"));
        let mut buffer = FrameBuffer::default();
        buffer.extend(&bytes);

        assert_eq!(drain(&mut buffer), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn trailing_partial_frame_is_kept() {
        let mut bytes = encode_frame(b"whole");
        let second = encode_frame(b"partial");
        bytes.extend(&second[..4]);
        let mut buffer = FrameBuffer::default();
        buffer.extend(&bytes);

        assert_eq!(drain(&mut buffer), vec![b"whole".to_vec()]);
        assert_eq!(buffer.len(), 4);

        buffer.extend(&second[4..]);
        assert_eq!(drain(&mut buffer), vec![b"partial".to_vec()]);
    }

    #[test]
    fn many_frames_in_one_read_are_taken_without_shifting() {
        let mut bytes = Vec::new();
        for i in 0..10_000u32 {
            bytes.extend(encode_frame(&i.to_be_bytes()));
        }
        let tail = encode_frame(b"tail");
        bytes.extend(&tail[..3]);

        let mut buffer = FrameBuffer::default();
        buffer.extend(&bytes);
        let frames = drain(&mut buffer);

        assert_eq!(frames.len(), 10_000);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.as_slice(), (i as u32).to_be_bytes());
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.start, bytes.len() - 3);

        buffer.extend(&tail[3..]);
        assert_eq!(buffer.start, 0);
        assert_eq!(drain(&mut buffer), vec![b"tail".to_vec()]);
        assert!(buffer.is_empty());

        buffer.extend(b"");
        assert_eq!(buffer.buf.len(), 0);
    }

    #[test]
    fn non_numeric_header_is_rejected() {
        let mut buffer = FrameBuffer::default();
        buffer.extend(b"12a\nxyz");
        assert!(matches!(buffer.next_frame(), Err(FrameError::InvalidLength(_))));

        let mut buffer = FrameBuffer::default();
        buffer.extend(b"\nxyz");
        assert!(matches!(buffer.next_frame(), Err(FrameError::InvalidLength(_))));
    }

    #[test]
    fn runaway_header_is_rejected() {
        let mut buffer = FrameBuffer::default();
        buffer.extend(&[b'9'; MAX_HEADER_BYTES + 1]);
        assert_eq!(
            buffer.next_frame(),
            Err(FrameError::HeaderTooLong(MAX_HEADER_BYTES))
        );
    }

    #[test]
    fn oversized_frame_is_rejected_before_buffering() {
        let mut buffer = FrameBuffer::new(8);
        buffer.extend(b"9\n");
        assert_eq!(buffer.next_frame(), Err(FrameError::TooLarge { size: 9, max: 8 }));
    }

    #[test]
    fn fill_reads_until_would_block() {
        let mut stream = ScriptedStream::default();
        let frame = encode_frame(b"payload");
        stream.reads.extend(frame.chunks(3).map(<[u8]>::to_vec));
        let mut framed = FrameStream::new(stream, DEFAULT_MAX_FRAME_BYTES);

        assert_eq!(framed.fill(64).unwrap(), ReadOutcome::Open(frame.len()));
        assert_eq!(framed.next_frame().unwrap(), Some(b"payload".to_vec()));
        assert_eq!(framed.fill(64).unwrap(), ReadOutcome::Open(0));
    }

    #[test]
    fn fill_reports_eof() {
        let stream = ScriptedStream {
            eof: true,
            ..Default::default()
        };
        let mut framed = FrameStream::new(stream, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(framed.fill(4).unwrap(), ReadOutcome::Eof(0));
    }

    #[test]
    fn blocked_writes_stay_queued_in_order() {
        let stream = ScriptedStream {
            write_limit: Some(5),
            ..Default::default()
        };
        let mut framed = FrameStream::new(stream, DEFAULT_MAX_FRAME_BYTES);

        framed.send_frame(b"abcdefgh").unwrap();
        framed.send_frame(b"ijk").unwrap();
        assert_eq!(framed.pending_write_bytes(), 6);
        assert_eq!(framed.get_ref().written, b"abcde");

        framed.stream.write_limit = None;
        framed.flush_pending().unwrap();
        assert_eq!(framed.pending_write_bytes(), 0);
        assert_eq!(framed.get_ref().written, b"abcdefghijk");
    }
}
