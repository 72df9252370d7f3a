//! Conditional LZ4 compression for packet payloads.
//!
//! The compression mode is negotiated during authentication. Even when LZ4 is
//! negotiated, small payloads skip compression and payloads that would grow are
//! sent raw; the header flag byte tells the receiver which case applies.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::protocol::CompressionType;

/// Compression flag: payload is uncompressed.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Compression flag: payload is LZ4-compressed with a size prefix.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Controls when payloads are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum serialized size (bytes) before compression is applied. Default: 256.
    pub threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { threshold: 256 }
    }
}

/// Compress a packet payload under the negotiated mode.
///
/// Returns the header flag byte and the bytes to put on the wire.
pub fn compress(data: &[u8], mode: CompressionType, config: &CompressionConfig) -> (u8, Vec<u8>) {
    if mode == CompressionType::NoCompression || data.len() < config.threshold {
        return (COMPRESSION_FLAG_NONE, data.to_vec());
    }

    let compressed = compress_prepend_size(data);
    if compressed.len() >= data.len() {
        (COMPRESSION_FLAG_NONE, data.to_vec())
    } else {
        (COMPRESSION_FLAG_LZ4, compressed)
    }
}

/// Decompress a received payload according to its header flag byte.
pub fn decompress(data: &[u8], flag: u8) -> Result<Vec<u8>, CompressionError> {
    match flag {
        COMPRESSION_FLAG_NONE => Ok(data.to_vec()),
        COMPRESSION_FLAG_LZ4 => {
            if data.is_empty() {
                return Err(CompressionError::EmptyPayload);
            }
            decompress_size_prepended(data)
                .map_err(|e| CompressionError::DecompressFailed(e.to_string()))
        }
        flag => Err(CompressionError::UnknownFlag(flag)),
    }
}

/// Errors that can occur during payload decompression.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// A compressed payload carried no bytes at all.
    #[error("empty compressed payload")]
    EmptyPayload,
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// An unknown compression flag byte was encountered.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
}
