//! Payload Compression
//!
//! LZ4 block compression shared by cache layers and archive records. A
//! compressed form is only kept when it is strictly smaller than the input.
//!
//! # Example
//!
//! ```
//! use scaleplane::compression::{Codec, CompressionAlgorithm};
//!
//! let codec = Codec::new(64);
//! let data = b"row,row,row,row,row,row,row,row,row,row,row,row,row,row,row,row,row";
//! let (packed, algorithm) = codec.compress(data);
//! assert_eq!(algorithm, CompressionAlgorithm::Lz4);
//! assert_eq!(codec.decompress(&packed, algorithm).unwrap().as_ref(), data);
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as-is
    #[default]
    None,
    /// LZ4 block format with size prefix
    Lz4,
}

impl CompressionAlgorithm {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    pub fn is_compressed(&self) -> bool {
        *self != CompressionAlgorithm::None
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// LZ4 compressor with a fixed high-compression level
#[derive(Debug, Clone, Copy)]
pub struct Lz4 {
    level: i32,
}

impl Lz4 {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: CompressionAlgorithm::Lz4.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: CompressionAlgorithm::Lz4.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Default for Lz4 {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Size-aware compression front end
#[derive(Debug, Clone)]
pub struct Codec {
    /// Inputs shorter than this are never compressed
    min_size: usize,
    lz4: Lz4,
}

impl Codec {
    /// Codec that skips inputs smaller than `min_size` bytes
    pub fn new(min_size: usize) -> Self {
        Self {
            min_size,
            lz4: Lz4::default(),
        }
    }

    /// Minimum input size considered for compression
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Compress `data` if worthwhile.
    ///
    /// Falls back to the raw bytes when the input is small, compression fails,
    /// or the output is not smaller.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if data.len() < self.min_size {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.lz4.compress(data) {
            Ok(packed) if packed.len() < data.len() => {
                (Bytes::from(packed), CompressionAlgorithm::Lz4)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!(error = %e, "compression failed, storing uncompressed");
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Reverse `compress`
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        match algorithm {
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(data)),
            CompressionAlgorithm::Lz4 => Ok(Bytes::from(self.lz4.decompress(data)?)),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPETITIVE: &[u8] = b"status=ok;status=ok;status=ok;status=ok;status=ok;status=ok;\
        status=ok;status=ok;status=ok;status=ok;status=ok;status=ok;status=ok;";

    #[test]
    fn test_lz4_roundtrip() {
        let lz4 = Lz4::default();
        let packed = lz4.compress(REPETITIVE).unwrap();
        assert!(packed.len() < REPETITIVE.len());
        assert_eq!(lz4.decompress(&packed).unwrap(), REPETITIVE);
    }

    #[test]
    fn test_small_input_left_alone() {
        let codec = Codec::new(1024);
        let (out, algorithm) = codec.compress(REPETITIVE);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(out.as_ref(), REPETITIVE);
    }

    #[test]
    fn test_incompressible_input_kept_raw() {
        let codec = Codec::new(0);
        let noise: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
        let (out, algorithm) = codec.compress(&noise);
        if algorithm == CompressionAlgorithm::None {
            assert_eq!(out.as_ref(), noise.as_slice());
        } else {
            assert!(out.len() < noise.len());
        }
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        let codec = Codec::default();
        let result = codec.decompress(&[0xff, 0xff, 0xff, 0x7f, 1, 2, 3], CompressionAlgorithm::Lz4);
        assert!(matches!(result, Err(Error::DecompressionFailed { .. })));
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(CompressionAlgorithm::None.to_string(), "none");
        assert_eq!(CompressionAlgorithm::Lz4.to_string(), "lz4");
        assert!(CompressionAlgorithm::Lz4.is_compressed());
    }
}
