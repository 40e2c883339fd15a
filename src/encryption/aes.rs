// AES-256-GCM chunk encryption

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::{BackupError, Result};

use super::Cryptor;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;

/// AES-256-GCM cryptor. Chunk format: `nonce || ciphertext || tag`.
pub struct AesGcmCryptor {
    cipher: Aes256Gcm,
}

impl AesGcmCryptor {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(BackupError::Encryption(format!(
                "Invalid key length: expected {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        })
    }

    pub fn from_hex_key(key: &str) -> Result<Self> {
        let bytes = hex::decode(key.trim())
            .map_err(|e| BackupError::Encryption(format!("Invalid hex key: {}", e)))?;
        Self::new(&bytes)
    }
}

impl Cryptor for AesGcmCryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| BackupError::Encryption("Encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(BackupError::Encryption(
                "Ciphertext is too short".to_string(),
            ));
        }
        let (nonce, sealed) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| BackupError::Encryption("Bad key or corrupted data".to_string()))
    }

    fn metadata_size(&self) -> u64 {
        (NONCE_SIZE + TAG_SIZE) as u64
    }
}
