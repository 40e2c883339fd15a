// Compression - streaming compressors for the transfer pipeline

pub mod gzip;
pub mod noop;

use crate::config::{CompressionConfig, CompressionKind};
use crate::error::Result;

/// Streaming compressor / decompressor.
///
/// `compress` may buffer and return an empty chunk; `flush_compress`
/// emits all residual bytes and finalizes the stream. The decompression
/// side is symmetric. Roundtrip preserves byte-for-byte equality.
pub trait Compression: Send {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>>;
    fn flush_compress(&mut self) -> Result<Vec<u8>>;
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>>;
    fn flush_decompress(&mut self) -> Result<Vec<u8>>;
}

/// Build a compressor for the configured algorithm.
pub fn get_compression(config: &CompressionConfig) -> Box<dyn Compression> {
    match config.kind {
        CompressionKind::Gzip => Box::new(gzip::GzipCompression::new(config.level)),
        CompressionKind::Noop => Box::new(noop::NoopCompression::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(config: &CompressionConfig, payload: &[u8], chunk: usize) -> Vec<u8> {
        let mut compressor = get_compression(config);
        let mut compressed = Vec::new();
        for part in payload.chunks(chunk.max(1)) {
            compressed.extend(compressor.compress(part).unwrap());
        }
        compressed.extend(compressor.flush_compress().unwrap());

        let mut decompressor = get_compression(config);
        let mut output = Vec::new();
        for part in compressed.chunks(chunk.max(1)) {
            output.extend(decompressor.decompress(part).unwrap());
        }
        output.extend(decompressor.flush_decompress().unwrap());
        output
    }

    #[test]
    fn test_gzip_roundtrip() {
        let config = CompressionConfig::default();
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(roundtrip(&config, &payload, 4096), payload);
    }

    #[test]
    fn test_gzip_roundtrip_uneven_chunks() {
        let config = CompressionConfig::default();
        let payload = b"short payload that does not align with chunk boundaries".to_vec();
        assert_eq!(roundtrip(&config, &payload, 7), payload);
    }

    #[test]
    fn test_noop_roundtrip() {
        let config = CompressionConfig {
            kind: CompressionKind::Noop,
            ..CompressionConfig::default()
        };
        let payload = b"as-is".to_vec();
        assert_eq!(roundtrip(&config, &payload, 3), payload);
    }

    #[test]
    fn test_gzip_empty_input() {
        let config = CompressionConfig::default();
        assert_eq!(roundtrip(&config, b"", 1), b"".to_vec());
    }
}
