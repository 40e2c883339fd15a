// Pass-through compression

use crate::error::Result;

use super::Compression;

#[derive(Default)]
pub struct NoopCompression;

impl Compression for NoopCompression {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn flush_compress(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn flush_decompress(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}
