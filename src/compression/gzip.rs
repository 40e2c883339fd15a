// Gzip compression backed by flate2

use std::io::Write;

use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression as Flate2Level;

use crate::error::{BackupError, Result};

use super::Compression;

/// Streaming gzip compressor.
///
/// Output produced so far is drained from the inner buffer on every
/// call; the gzip trailer is written by `flush_compress`.
pub struct GzipCompression {
    encoder: Option<GzEncoder<Vec<u8>>>,
    decoder: Option<GzDecoder<Vec<u8>>>,
}

impl GzipCompression {
    pub fn new(level: u32) -> Self {
        Self {
            encoder: Some(GzEncoder::new(Vec::new(), Flate2Level::new(level))),
            decoder: Some(GzDecoder::new(Vec::new())),
        }
    }
}

impl Compression for GzipCompression {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| BackupError::Compression("Compressor already finalized".to_string()))?;
        encoder
            .write_all(data)
            .map_err(|e| BackupError::Compression(format!("Compression failed: {}", e)))?;
        Ok(std::mem::take(encoder.get_mut()))
    }

    fn flush_compress(&mut self) -> Result<Vec<u8>> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| BackupError::Compression("Compressor already finalized".to_string()))?;
        encoder
            .finish()
            .map_err(|e| BackupError::Compression(format!("Compression flush failed: {}", e)))
    }

    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| BackupError::Compression("Decompressor already finalized".to_string()))?;
        decoder
            .write_all(data)
            .map_err(|e| BackupError::Compression(format!("Decompression failed: {}", e)))?;
        Ok(std::mem::take(decoder.get_mut()))
    }

    fn flush_decompress(&mut self) -> Result<Vec<u8>> {
        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| BackupError::Compression("Decompressor already finalized".to_string()))?;
        decoder
            .finish()
            .map_err(|e| BackupError::Compression(format!("Decompression flush failed: {}", e)))
    }
}
