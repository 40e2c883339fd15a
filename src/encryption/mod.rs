// Encryption - authenticated symmetric encryption over fixed-size chunks

pub mod aes;
pub mod noop;

use crate::config::{EncryptionConfig, EncryptionKind};
use crate::error::Result;

/// Authenticated symmetric encryption with a fixed key.
///
/// Implementations report their per-chunk metadata overhead so the
/// pipeline can size the decryption buffer to exactly one ciphertext
/// chunk.
pub trait Cryptor: Send {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
    /// Per-chunk overhead in bytes added by `encrypt`.
    fn metadata_size(&self) -> u64;
}

/// Build a cryptor for the configured algorithm.
pub fn get_encryption(config: &EncryptionConfig) -> Result<Box<dyn Cryptor>> {
    Ok(match config.kind {
        EncryptionKind::Aes256Gcm => Box::new(aes::AesGcmCryptor::from_hex_key(&config.key)?),
        EncryptionKind::Noop => Box::new(noop::NoopCryptor::default()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aes_config() -> EncryptionConfig {
        EncryptionConfig {
            key: "11".repeat(32),
            ..EncryptionConfig::default()
        }
    }

    #[test]
    fn test_aes_roundtrip() {
        let cryptor = get_encryption(&aes_config()).unwrap();
        let payload = b"part payload".to_vec();
        let sealed = cryptor.encrypt(&payload).unwrap();
        assert_eq!(sealed.len() as u64, payload.len() as u64 + cryptor.metadata_size());
        assert_eq!(cryptor.decrypt(&sealed).unwrap(), payload);
    }

    #[test]
    fn test_aes_rejects_tampered_data() {
        let cryptor = get_encryption(&aes_config()).unwrap();
        let mut sealed = cryptor.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(cryptor.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_aes_rejects_wrong_key() {
        let cryptor = get_encryption(&aes_config()).unwrap();
        let sealed = cryptor.encrypt(b"payload").unwrap();

        let other = EncryptionConfig {
            key: "22".repeat(32),
            ..EncryptionConfig::default()
        };
        let other_cryptor = get_encryption(&other).unwrap();
        assert!(other_cryptor.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let config = EncryptionConfig {
            key: "1234".to_string(),
            ..EncryptionConfig::default()
        };
        assert!(get_encryption(&config).is_err());
    }

    #[test]
    fn test_noop_overhead_is_zero() {
        let config = EncryptionConfig {
            kind: EncryptionKind::Noop,
            ..EncryptionConfig::default()
        };
        let cryptor = get_encryption(&config).unwrap();
        assert_eq!(cryptor.metadata_size(), 0);
        assert_eq!(cryptor.decrypt(&cryptor.encrypt(b"abc").unwrap()).unwrap(), b"abc");
    }
}
