//! NETCONF message framing (RFC 6242).
//!
//! Two framings exist:
//!
//! ```text
//! base:1.0  end-of-message   <payload>\n]]>]]>\n
//! base:1.1  chunked          \n#<len>\n<data> ... \n##\n
//! ```
//!
//! The hello exchange always uses end-of-message framing. Chunked framing is
//! selected once both peers advertise base:1.1.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use rand::Rng;

/// End-of-message marker for base:1.0 framing.
pub const EOM_MARKER: &[u8] = b"]]>]]>";

/// Largest chunk size allowed on the wire.
pub const MAX_CHUNK_SIZE: u64 = u32::MAX as u64;

/// Default chunk size used by the chunked sender.
pub const DEFAULT_CHUNK_SIZE: usize = 65536;

/// Framing in effect for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    EndOfMessage,
    Chunked,
}

/// Frames a payload with the base:1.0 end-of-message marker.
pub fn encode_eom(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(payload.len() + EOM_MARKER.len() + 2);
    dst.put_slice(payload);
    dst.put_u8(b'\n');
    dst.put_slice(EOM_MARKER);
    dst.put_u8(b'\n');
}

/// Receiver for base:1.0 framing.
///
/// Accumulates bytes until the marker appears. The scan position is kept so
/// partial reads are not rescanned from the start.
#[derive(Debug, Default)]
pub struct EomDecoder {
    scanned: usize,
}

impl EomDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next message if the buffer holds a complete one, consuming
    /// it and its marker from `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Option<BytesMut> {
        let start = self.scanned.saturating_sub(EOM_MARKER.len() - 1);
        let found = buf[start..]
            .windows(EOM_MARKER.len())
            .position(|w| w == EOM_MARKER)
            .map(|p| p + start);

        match found {
            Some(pos) => {
                let message = buf.split_to(pos);
                let _ = buf.split_to(EOM_MARKER.len());
                self.scanned = 0;
                Some(message)
            }
            None => {
                self.scanned = buf.len();
                None
            }
        }
    }

    pub fn reset(&mut self) {
        self.scanned = 0;
    }
}

/// States of the chunked framing receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    BeginningOfMsg,
    BeforeChunkSize,
    InChunkSize,
    InChunkData,
    AfterChunkData,
    EndingMsg,
    EndOfMsg,
}

/// Receiver for base:1.1 chunked framing.
///
/// A byte-level state machine. Chunk data is copied out in bulk once its
/// size is known; everything else is consumed a byte at a time.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    size_digits: usize,
    chunk_size: u64,
    remaining: u64,
    message: BytesMut,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::BeginningOfMsg,
            size_digits: 0,
            chunk_size: 0,
            remaining: 0,
            message: BytesMut::new(),
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Returns true if no part of a message has been consumed yet.
    pub fn is_idle(&self) -> bool {
        self.state == ChunkState::BeginningOfMsg
    }

    fn reset(&mut self) {
        self.state = ChunkState::BeginningOfMsg;
        self.size_digits = 0;
        self.chunk_size = 0;
        self.remaining = 0;
        self.message.clear();
    }

    fn malformed(&mut self, reason: String) -> ProtocolError {
        self.reset();
        ProtocolError::Malformed(reason)
    }

    /// Consumes bytes from `buf` until a message completes or the buffer is
    /// exhausted.
    ///
    /// Returns `Ok(Some(message))` with the reassembled payload, `Ok(None)`
    /// if more input is needed, or `Err` on a framing violation. After an
    /// error the decoder is back in its initial state and the offending byte
    /// has been consumed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, ProtocolError> {
        while !buf.is_empty() {
            if self.state == ChunkState::InChunkData {
                let take = std::cmp::min(self.remaining, buf.len() as u64) as usize;
                self.message.extend_from_slice(&buf.split_to(take));
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.state = ChunkState::AfterChunkData;
                }
                continue;
            }

            let byte = buf[0];
            let _ = buf.split_to(1);

            match self.state {
                ChunkState::BeginningOfMsg | ChunkState::AfterChunkData => {
                    if byte != b'\n' {
                        return Err(self.malformed(format!(
                            "expected newline before chunk header, got 0x{:02x}",
                            byte
                        )));
                    }
                    self.state = ChunkState::BeforeChunkSize;
                }
                ChunkState::BeforeChunkSize => {
                    if byte != b'#' {
                        return Err(self.malformed(format!("expected '#', got 0x{:02x}", byte)));
                    }
                    self.state = ChunkState::InChunkSize;
                    self.size_digits = 0;
                    self.chunk_size = 0;
                }
                ChunkState::InChunkSize => match byte {
                    b'#' if self.size_digits == 0 => {
                        if self.message.is_empty() {
                            return Err(self.malformed("end-of-chunks marker before any chunk".into()));
                        }
                        self.state = ChunkState::EndingMsg;
                    }
                    b'0'..=b'9' => {
                        if self.size_digits == 0 && byte == b'0' {
                            return Err(self.malformed("chunk size must not start with 0".into()));
                        }
                        self.chunk_size = self.chunk_size * 10 + u64::from(byte - b'0');
                        self.size_digits += 1;
                        if self.chunk_size > MAX_CHUNK_SIZE {
                            return Err(self.malformed(format!(
                                "chunk size exceeds maximum of {}",
                                MAX_CHUNK_SIZE
                            )));
                        }
                    }
                    b'\n' if self.size_digits > 0 => {
                        self.remaining = self.chunk_size;
                        self.state = ChunkState::InChunkData;
                    }
                    _ => {
                        return Err(self.malformed(format!(
                            "unexpected byte 0x{:02x} in chunk size",
                            byte
                        )));
                    }
                },
                ChunkState::EndingMsg => {
                    if byte != b'\n' {
                        return Err(self.malformed(format!(
                            "expected newline after end-of-chunks marker, got 0x{:02x}",
                            byte
                        )));
                    }
                    self.state = ChunkState::EndOfMsg;
                }
                ChunkState::InChunkData | ChunkState::EndOfMsg => unreachable!(),
            }

            if self.state == ChunkState::EndOfMsg {
                let message = self.message.split();
                self.reset();
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

/// Sender for base:1.1 chunked framing.
#[derive(Debug, Clone)]
pub struct ChunkedEncoder {
    max_chunk_size: usize,
    randomize: bool,
}

impl Default for ChunkedEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkedEncoder {
    pub fn new(max_chunk_size: usize) -> Self {
        let max_chunk_size = max_chunk_size.clamp(1, MAX_CHUNK_SIZE as usize);
        Self {
            max_chunk_size,
            randomize: false,
        }
    }

    /// Picks each chunk size uniformly from `1..=max_chunk_size`.
    pub fn with_randomized_chunks(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn encode(&self, payload: &[u8], dst: &mut BytesMut) {
        let mut rng = rand::thread_rng();
        let mut rest = payload;
        while !rest.is_empty() {
            let limit = std::cmp::min(self.max_chunk_size, rest.len());
            let size = if self.randomize {
                rng.gen_range(1..=limit)
            } else {
                limit
            };
            let header = format!("\n#{}\n", size);
            dst.reserve(header.len() + size);
            dst.put_slice(header.as_bytes());
            dst.put_slice(&rest[..size]);
            rest = &rest[size..];
        }
        dst.put_slice(b"\n##\n");
    }
}
