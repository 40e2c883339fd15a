// Pass-through encryption

use crate::error::Result;

use super::Cryptor;

#[derive(Default)]
pub struct NoopCryptor;

impl Cryptor for NoopCryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn metadata_size(&self) -> u64 {
        0
    }
}
