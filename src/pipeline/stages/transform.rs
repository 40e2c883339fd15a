// Compression and encryption pipeline stages

use crate::compression::Compression;
use crate::encryption::Cryptor;
use crate::error::Result;
use crate::pipeline::stage::{Emitter, Stage};

pub struct CompressStage {
    compressor: Box<dyn Compression>,
}

impl CompressStage {
    pub fn new(compressor: Box<dyn Compression>) -> Self {
        Self { compressor }
    }
}

impl Stage for CompressStage {
    type In = Vec<u8>;
    type Out = Vec<u8>;

    fn on_item(&mut self, item: Vec<u8>, _index: u64, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        let compressed = self.compressor.compress(&item)?;
        if !compressed.is_empty() {
            out.emit(compressed)?;
        }
        Ok(())
    }

    fn on_done(&mut self, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        let rest = self.compressor.flush_compress()?;
        if !rest.is_empty() {
            out.emit(rest)?;
        }
        Ok(())
    }
}

pub struct DecompressStage {
    compressor: Box<dyn Compression>,
}

impl DecompressStage {
    pub fn new(compressor: Box<dyn Compression>) -> Self {
        Self { compressor }
    }
}

impl Stage for DecompressStage {
    type In = Vec<u8>;
    type Out = Vec<u8>;

    fn on_item(&mut self, item: Vec<u8>, _index: u64, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        let decompressed = self.compressor.decompress(&item)?;
        if !decompressed.is_empty() {
            out.emit(decompressed)?;
        }
        Ok(())
    }

    fn on_done(&mut self, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        let rest = self.compressor.flush_decompress()?;
        if !rest.is_empty() {
            out.emit(rest)?;
        }
        Ok(())
    }
}

/// Encrypt each chunk. The preceding chunking stage bounds chunks to
/// the plaintext chunk size.
pub struct EncryptStage {
    cryptor: Box<dyn Cryptor>,
}

impl EncryptStage {
    pub fn new(cryptor: Box<dyn Cryptor>) -> Self {
        Self { cryptor }
    }
}

impl Stage for EncryptStage {
    type In = Vec<u8>;
    type Out = Vec<u8>;

    fn on_item(&mut self, item: Vec<u8>, _index: u64, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        out.emit(self.cryptor.encrypt(&item)?)
    }
}

/// Decrypt each chunk. The preceding chunking stage must deliver chunks
/// of exactly plaintext-chunk-size + metadata_size (the final chunk may
/// be short).
pub struct DecryptStage {
    cryptor: Box<dyn Cryptor>,
}

impl DecryptStage {
    pub fn new(cryptor: Box<dyn Cryptor>) -> Self {
        Self { cryptor }
    }
}

impl Stage for DecryptStage {
    type In = Vec<u8>;
    type Out = Vec<u8>;

    fn on_item(&mut self, item: Vec<u8>, _index: u64, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        out.emit(self.cryptor.decrypt(&item)?)
    }
}
