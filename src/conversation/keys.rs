//! Key Exchange Service
//!
//! Generates one RSA key pair per conversation and encrypts/decrypts archive
//! bytes with it. RSA-OAEP (SHA-256) only fits `k - 66` bytes per operation,
//! so messages are processed in blocks: every plaintext block of up to
//! `k - 66` bytes becomes exactly `k` ciphertext bytes, and blocks are
//! concatenated in order.

use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use super::types::{KeyPair, ProtocolError};

/// Modulus size of conversation keys
pub const KEY_BITS: usize = 2048;

/// OAEP overhead for SHA-256: 2 * hash length + 2
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

#[derive(Debug, Clone)]
pub struct KeyExchangeService {
    bits: usize,
}

impl KeyExchangeService {
    pub fn new() -> Self {
        Self { bits: KEY_BITS }
    }

    /// Generate a fresh key pair. CPU heavy; call from a blocking context.
    pub fn generate_key_pair(&self) -> Result<KeyPair, ProtocolError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, self.bits)
            .map_err(|e| ProtocolError::KeyGeneration(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ProtocolError::KeyGeneration(e.to_string()))?;

        Ok(KeyPair {
            private_key,
            public_key,
            public_key_pem,
        })
    }

    /// Generate a key pair on the blocking thread pool
    pub async fn generate_key_pair_async(&self) -> Result<KeyPair, ProtocolError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.generate_key_pair())
            .await
            .map_err(|e| ProtocolError::KeyGeneration(format!("key generation task failed: {}", e)))?
    }

    /// Encrypt `message` for the holder of `public_key`
    pub fn encrypt(&self, message: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>, ProtocolError> {
        if message.is_empty() {
            return Err(ProtocolError::Crypto("nothing to encrypt".to_string()));
        }

        let block_len = public_key.size();
        let chunk_len = block_len
            .checked_sub(OAEP_OVERHEAD)
            .filter(|len| *len > 0)
            .ok_or_else(|| ProtocolError::Crypto("public key too small for OAEP".to_string()))?;

        let mut ciphertext = Vec::with_capacity(message.len().div_ceil(chunk_len) * block_len);
        for chunk in message.chunks(chunk_len) {
            let block = public_key
                .encrypt(&mut OsRng, Oaep::new::<Sha256>(), chunk)
                .map_err(|e| ProtocolError::Crypto(e.to_string()))?;
            ciphertext.extend_from_slice(&block);
        }

        Ok(ciphertext)
    }

    /// Decrypt a block sequence produced by [`encrypt`](Self::encrypt)
    pub fn decrypt(&self, ciphertext: &[u8], private_key: &RsaPrivateKey) -> Result<Vec<u8>, ProtocolError> {
        let block_len = private_key.size();
        if ciphertext.is_empty() || ciphertext.len() % block_len != 0 {
            return Err(ProtocolError::Crypto(format!(
                "ciphertext length {} is not a multiple of {}",
                ciphertext.len(),
                block_len
            )));
        }

        let mut message = Vec::with_capacity(ciphertext.len());
        for (index, block) in ciphertext.chunks(block_len).enumerate() {
            let plain = private_key
                .decrypt(Oaep::new::<Sha256>(), block)
                .map_err(|e| ProtocolError::Crypto(format!("block {}: {}", index, e)))?;
            message.extend_from_slice(&plain);
        }

        Ok(message)
    }

    /// Decrypt on the blocking thread pool
    pub async fn decrypt_async(
        &self,
        ciphertext: Vec<u8>,
        private_key: RsaPrivateKey,
    ) -> Result<Vec<u8>, ProtocolError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.decrypt(&ciphertext, &private_key))
            .await
            .map_err(|e| ProtocolError::Crypto(format!("decrypt task failed: {}", e)))?
    }
}

impl Default for KeyExchangeService {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a public key received in a phase-1 response
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, ProtocolError> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| ProtocolError::Crypto(e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================
