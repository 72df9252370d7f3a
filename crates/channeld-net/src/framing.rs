//! Packet framing for the hub TCP stream.
//!
//! Every packet on the wire is a 5-byte tag followed by the payload:
//!
//! ```text
//! +------+------+------+------+------+---------------------+
//! | 'C'  | 'H'  | 'N'  | size | flag |  payload (size B)   |   size <= 0xFF
//! +------+------+------+------+------+---------------------+
//! | 'C'  | hi   | mid  | low  | flag |  payload (size B)   |   size >  0xFF
//! +------+------+------+------+------+---------------------+
//! ```
//!
//! The size bytes overwrite magic bytes as the payload grows. Because the
//! largest payload is [`MAX_PACKET_SIZE`] (`0x47_FFFF`), the high byte of a
//! large size can never be `'H'`, so byte 1 alone decides which form applies.
//! The decoder also accepts the two-byte tier `['C', 'H', mid, low]` written by
//! older peers; the encoder never emits it.
//!
//! `flag` is the compression flag (see [`crate::compression`]). The payload is
//! a postcard-encoded [`Packet`].

use tracing::{error, warn};

use crate::compression::{self, CompressionConfig, CompressionError};
use crate::protocol::{self, CompressionType, MessageError, MessagePack, Packet};

/// Magic bytes marking the start of a packet.
pub const MAGIC: [u8; 3] = [b'C', b'H', b'N'];

/// Filler for the size byte; never meaningful on its own.
pub const SIZE_FILLER: u8 = b'L';

/// Length of the packet tag.
pub const HEADER_LEN: usize = 5;

/// Largest payload the header can describe unambiguously.
pub const MAX_PACKET_SIZE: usize = 0x47_FFFF;

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The first byte of the buffer is not the packet magic.
    #[error("invalid packet magic byte 0x{0:02X}")]
    BadMagic(u8),

    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The payload could not be decompressed.
    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// The payload could not be (de)serialized.
    #[error(transparent)]
    Message(#[from] MessageError),
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Build the 5-byte tag for a payload of `size` bytes.
pub fn encode_header(size: usize, flag: u8) -> Result<[u8; HEADER_LEN], FrameError> {
    if size > MAX_PACKET_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: MAX_PACKET_SIZE,
        });
    }

    let mut tag = [MAGIC[0], MAGIC[1], MAGIC[2], SIZE_FILLER, flag];
    if size <= 0xFF {
        tag[3] = size as u8;
    } else {
        tag[1] = (size >> 16) as u8;
        tag[2] = (size >> 8) as u8;
        tag[3] = size as u8;
    }
    Ok(tag)
}

/// Parse a 5-byte tag into `(payload size, compression flag)`.
pub fn decode_header(tag: &[u8; HEADER_LEN]) -> Result<(usize, u8), FrameError> {
    if tag[0] != MAGIC[0] {
        return Err(FrameError::BadMagic(tag[0]));
    }

    let low = tag[3] as usize;
    let size = if tag[1] != MAGIC[1] {
        (tag[1] as usize) << 16 | (tag[2] as usize) << 8 | low
    } else if tag[2] != MAGIC[2] {
        (tag[2] as usize) << 8 | low
    } else {
        low
    };
    Ok((size, tag[4]))
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serialize, compress, and frame a packet.
pub fn encode_packet(
    packet: &Packet,
    mode: CompressionType,
    config: &CompressionConfig,
) -> Result<Vec<u8>, FrameError> {
    let payload = protocol::encode_packet_payload(packet)?;
    let (flag, body) = compression::compress(&payload, mode, config);
    let tag = encode_header(body.len(), flag)?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Accumulates outbound envelopes into one packet without exceeding a size
/// limit.
#[derive(Debug)]
pub struct PacketBuilder {
    packet: Packet,
    size: usize,
    max: usize,
}

impl PacketBuilder {
    /// Create a builder bounded by `max` payload bytes.
    pub fn new(max: usize) -> Self {
        Self {
            packet: Packet::default(),
            // Room for the list length prefix.
            size: 5,
            max: max.min(MAX_PACKET_SIZE),
        }
    }

    /// Append `msg` if it fits; otherwise hand it back untouched.
    ///
    /// A message handed back while the builder is still empty can never fit.
    pub fn try_push(&mut self, msg: MessagePack) -> Option<MessagePack> {
        let hint = msg.size_hint();
        if self.size + hint > self.max {
            return Some(msg);
        }
        self.size += hint;
        self.packet.messages.push(msg);
        None
    }

    /// Whether no message has been added yet.
    pub fn is_empty(&self) -> bool {
        self.packet.messages.is_empty()
    }

    /// Number of messages added so far.
    pub fn len(&self) -> usize {
        self.packet.messages.len()
    }

    /// Finish and return the packet.
    pub fn finish(self) -> Packet {
        self.packet
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Incremental decoder that reassembles packets from arbitrary read chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload_size: usize,
    /// The buffered start was picked by resync without a complete frame to
    /// confirm it.
    tentative: bool,
}

/// How a possible packet start inside the buffer looks.
enum Candidate {
    /// A complete frame that decodes.
    Verified,
    /// Plausible, but its frame is not fully buffered yet.
    Pending,
    /// Cannot be a packet start.
    Invalid,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl FrameDecoder {
    /// Create a decoder that rejects payloads larger than `max_payload_size`.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_payload_size: max_payload_size.min(MAX_PACKET_SIZE),
            tentative: false,
        }
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.tentative = false;
    }

    /// Try to take one packet out of the buffer.
    ///
    /// Returns `None` when more bytes are needed. Errors consume the offending
    /// bytes, so calling again always makes progress.
    pub fn next_frame(&mut self) -> Option<Result<Packet, FrameError>> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let mut tag = [0u8; HEADER_LEN];
        tag.copy_from_slice(&self.buf[..HEADER_LEN]);

        let (size, flag) = match decode_header(&tag) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.resync();
                return Some(Err(e));
            }
        };

        if size > self.max_payload_size {
            self.resync();
            return Some(Err(FrameError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            }));
        }

        let end = HEADER_LEN + size;
        if self.buf.len() < end {
            if self.tentative
                && let Some(start) = self.first_verified()
            {
                warn!("Skipping {} bytes of a false packet start", start);
                self.buf.drain(..start);
                self.tentative = false;
                return self.next_frame();
            }
            return None;
        }

        let result = decode_frame_body(&self.buf[HEADER_LEN..end], flag);
        if result.is_err() && self.tentative {
            self.resync();
        } else {
            self.buf.drain(..end);
            self.tentative = false;
        }
        Some(result)
    }

    /// Feed `bytes` and return every envelope of every complete packet.
    ///
    /// Bad packets are logged and skipped.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<MessagePack> {
        self.push(bytes);

        let mut out = Vec::new();
        while let Some(result) = self.next_frame() {
            match result {
                Ok(packet) => out.extend(packet.messages),
                Err(e @ (FrameError::BadMagic(_) | FrameError::PayloadTooLarge { .. })) => {
                    warn!("Dropping unframed bytes: {}", e);
                }
                Err(e) => {
                    error!("Failed to decode packet: {}", e);
                }
            }
        }
        out
    }

    /// Discard bytes up to the next possible packet start.
    ///
    /// A start whose complete frame decodes wins. Otherwise the first start
    /// still waiting for bytes is kept tentatively; with neither, the buffer is
    /// cleared.
    fn resync(&mut self) {
        let mut pending = None;
        for start in 1..self.buf.len() {
            if self.buf[start] != MAGIC[0] {
                continue;
            }
            match self.candidate_at(start) {
                Candidate::Verified => {
                    self.buf.drain(..start);
                    self.tentative = false;
                    return;
                }
                Candidate::Pending => {
                    pending.get_or_insert(start);
                }
                Candidate::Invalid => {}
            }
        }
        match pending {
            Some(start) => {
                self.buf.drain(..start);
                self.tentative = true;
            }
            None => {
                self.buf.clear();
                self.tentative = false;
            }
        }
    }

    fn first_verified(&self) -> Option<usize> {
        (1..self.buf.len()).find(|&start| {
            self.buf[start] == MAGIC[0] && matches!(self.candidate_at(start), Candidate::Verified)
        })
    }

    fn candidate_at(&self, start: usize) -> Candidate {
        let Some(tag) = self.buf.get(start..start + HEADER_LEN) else {
            return Candidate::Pending;
        };
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(tag);
        let (size, flag) = match decode_header(&header) {
            Ok((size, flag)) if size <= self.max_payload_size => (size, flag),
            _ => return Candidate::Invalid,
        };
        let body_start = start + HEADER_LEN;
        match self.buf.get(body_start..body_start + size) {
            Some(body) if decode_frame_body(body, flag).is_ok() => Candidate::Verified,
            Some(_) => Candidate::Invalid,
            None => Candidate::Pending,
        }
    }
}

fn decode_frame_body(body: &[u8], flag: u8) -> Result<Packet, FrameError> {
    let payload = compression::decompress(body, flag)?;
    Ok(protocol::decode_packet_payload(&payload)?)
}
