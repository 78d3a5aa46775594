//! Payload compression.
//!
//! The messenger only decides *when* to compress: payloads below the configured threshold,
//! payloads that look incompressible, and payloads that would not shrink are sent as-is.
//! The algorithm sits behind the [`Compressor`] trait; LZ4 and Zstd ship built in.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

impl CompressionKind {
    pub fn compressor(self) -> Box<dyn Compressor> {
        match self {
            CompressionKind::Lz4 => Box::new(Lz4Compressor),
            CompressionKind::Zstd => Box::new(ZstdCompressor::default()),
        }
    }
}

/// A compression algorithm.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompresses `data`, failing if the output would exceed `limit` bytes.
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>>;
}

/// Minimum entropy threshold for compression (0.0-8.0 bits per byte)
/// Data above this threshold is unlikely to compress well
const MAX_ENTROPY_THRESHOLD: f64 = 7.5;

/// Calculate Shannon entropy of data (bits per byte)
/// Returns a value between 0.0 (all identical) and 8.0 (perfectly random)
fn calculate_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    let mut entropy = 0.0;

    for &count in &freq {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }

    entropy
}

/// Size and entropy gate in front of the compressor.
fn worth_compressing(data: &[u8], threshold_bytes: usize) -> bool {
    if data.len() < threshold_bytes {
        return false;
    }

    // sample the first 512 bytes, encrypted or already compressed data sits near 8.0
    let sample_size = data.len().min(512);
    calculate_entropy(&data[..sample_size]) < MAX_ENTROPY_THRESHOLD
}

/// LZ4 block format with a 4-byte little-endian size prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        if data.len() < 4 {
            return Err(ProtocolError::DecompressionFailure);
        }

        // check the claimed size before lz4_flex allocates for it
        let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if claimed_size > limit {
            return Err(ProtocolError::DecompressionFailure);
        }

        let decompressed = lz4_flex::decompress_size_prepended(data)
            .map_err(|_| ProtocolError::DecompressionFailure)?;

        if decompressed.len() > limit {
            return Err(ProtocolError::DecompressionFailure);
        }
        Ok(decompressed)
    }
}

/// Zstd stream format.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        zstd::stream::copy_encode(data, &mut out, self.level)
            .map_err(|_| ProtocolError::CompressionFailure)?;
        Ok(out)
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut reader =
            zstd::stream::Decoder::new(data).map_err(|_| ProtocolError::DecompressionFailure)?;

        // read in chunks to enforce the size limit
        let mut buffer = [0u8; 8192];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&buffer[..n]);
                    if out.len() > limit {
                        return Err(ProtocolError::DecompressionFailure);
                    }
                }
                Err(_) => return Err(ProtocolError::DecompressionFailure),
            }
        }
        Ok(out)
    }
}

/// Compresses `data` when it passes the threshold and entropy gate and the result is smaller.
///
/// Returns `None` when the payload should go out uncompressed.
pub fn maybe_compress(
    data: &[u8],
    compressor: &dyn Compressor,
    threshold_bytes: usize,
) -> Result<Option<Vec<u8>>> {
    if !worth_compressing(data, threshold_bytes) {
        return Ok(None);
    }

    let compressed = compressor.compress(data)?;
    if compressed.len() < data.len() {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024 * 1024;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_lz4_compression_roundtrip() {
        let original = b"Hello, World! This is a test of LZ4 compression.";
        let compressed = Lz4Compressor.compress(original).unwrap();
        let decompressed = Lz4Compressor.decompress(&compressed, LIMIT).unwrap();
        assert_eq!(original.as_slice(), decompressed.as_slice());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zstd_compression_roundtrip() {
        let zstd = ZstdCompressor::default();
        let original = b"Hello, World! This is a test of Zstd compression.";
        let compressed = zstd.compress(original).unwrap();
        let decompressed = zstd.decompress(&compressed, LIMIT).unwrap();
        assert_eq!(original.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn test_lz4_oom_attack_prevention() {
        // claims to decompress to 0xbbbb602b bytes
        let malicious_payload = vec![0x2b, 0x60, 0xbb, 0xbb];
        assert!(Lz4Compressor.decompress(&malicious_payload, LIMIT).is_err());
    }

    #[test]
    fn test_lz4_short_input_rejection() {
        assert!(Lz4Compressor.decompress(&[0x2b, 0x60], LIMIT).is_err());
    }

    #[test]
    fn test_malformed_compressed_data() {
        let malformed = vec![0x10, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff];
        assert!(Lz4Compressor.decompress(&malformed, LIMIT).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zstd_limit_enforced() {
        let zstd = ZstdCompressor::default();
        let compressed = zstd.compress(&vec![7u8; 64 * 1024]).unwrap();
        assert!(zstd.decompress(&compressed, 1024).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_below_threshold_untouched() {
        assert!(maybe_compress(b"tiny", &Lz4Compressor, 512)
            .unwrap()
            .is_none());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_low_entropy_compressed() {
        let data = vec![0u8; 2048];
        let out = maybe_compress(&data, &Lz4Compressor, 512).unwrap().unwrap();
        assert!(out.len() < data.len());
        assert_eq!(Lz4Compressor.decompress(&out, LIMIT).unwrap(), data);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_high_entropy_skipped() {
        let data: Vec<u8> = (0..=255).cycle().take(2048).collect();
        assert!(maybe_compress(&data, &Lz4Compressor, 512).unwrap().is_none());
    }

    #[test]
    fn test_entropy_calculation() {
        assert!(calculate_entropy(&[0u8; 100]) < 0.1);

        let random: Vec<u8> = (0..=255).cycle().take(1000).collect();
        assert!(calculate_entropy(&random) > 7.0);

        assert!(calculate_entropy(&[0, 1, 0, 1, 0, 1, 0, 1]) < 2.0);
    }
}
