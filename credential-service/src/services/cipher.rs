//! Encryption at rest for credential secrets.
//!
//! Stored layout is `nonce (24 bytes) || XChaCha20-Poly1305 ciphertext+tag`.

use crate::services::error::ServiceError;
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use secrecy::{ExposeSecret, Secret};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;

/// Opaque symmetric encryption capability.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ServiceError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ServiceError>;
}

pub struct XChaChaCipher {
    cipher: XChaCha20Poly1305,
}

impl XChaChaCipher {
    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64_key(key: &Secret<String>) -> Result<Self, ServiceError> {
        let bytes = STANDARD
            .decode(key.expose_secret().trim())
            .map_err(|_| ServiceError::Validation("encryption key is not valid base64".into()))?;

        if bytes.len() != KEY_SIZE {
            return Err(ServiceError::Validation(format!(
                "encryption key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }

        let cipher = XChaCha20Poly1305::new_from_slice(&bytes)
            .map_err(|_| ServiceError::Validation("invalid encryption key".into()))?;

        Ok(Self { cipher })
    }
}

impl SecretCipher for XChaChaCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ServiceError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| ServiceError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ServiceError> {
        if ciphertext.len() <= NONCE_SIZE {
            return Err(ServiceError::DecryptionFailed);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_SIZE);
        // The AEAD error carries no detail, and none is surfaced.
        self.cipher
            .decrypt(XNonce::from_slice(nonce), body)
            .map_err(|_| ServiceError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Secret<String> {
        Secret::new(STANDARD.encode([byte; KEY_SIZE]))
    }

    #[test]
    fn test_decrypt_recovers_plaintext() {
        let cipher = XChaChaCipher::from_base64_key(&key(7)).unwrap();
        let sealed = cipher.encrypt(b"sk-ant-api03-secret").unwrap();

        assert_eq!(sealed.len(), NONCE_SIZE + b"sk-ant-api03-secret".len() + 16);
        assert!(!sealed.windows(6).any(|w| w == b"sk-ant"));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"sk-ant-api03-secret");
    }

    #[test]
    fn test_nonce_is_fresh_per_encryption() {
        let cipher = XChaChaCipher::from_base64_key(&key(7)).unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = XChaChaCipher::from_base64_key(&key(7)).unwrap();
        let mut sealed = cipher.encrypt(b"sk-proj-abcdef").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let err = cipher.decrypt(&sealed).unwrap_err();
        assert!(matches!(err, ServiceError::DecryptionFailed));
        assert_eq!(err.to_string(), "Decryption failed");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = XChaChaCipher::from_base64_key(&key(1))
            .unwrap()
            .encrypt(b"secret")
            .unwrap();
        let other = XChaChaCipher::from_base64_key(&key(2)).unwrap();
        assert!(matches!(
            other.decrypt(&sealed),
            Err(ServiceError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_truncated_input_fails() {
        let cipher = XChaChaCipher::from_base64_key(&key(7)).unwrap();
        assert!(matches!(
            cipher.decrypt(&[0u8; 10]),
            Err(ServiceError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(XChaChaCipher::from_base64_key(&Secret::new("not base64!".into())).is_err());
        let short = Secret::new(STANDARD.encode([1u8; 16]));
        assert!(XChaChaCipher::from_base64_key(&short).is_err());
    }
}
