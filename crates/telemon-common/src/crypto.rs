//! RSA PKCS#1 v1.5 framing for batch bodies.
//!
//! A single PKCS#1 v1.5 block holds at most `k - 11` bytes of plaintext
//! (`k` being the modulus size in bytes), so payloads are cut into chunks
//! of that size and each chunk becomes one `k`-byte ciphertext block. The
//! receiver splits on `k` and concatenates the decrypted chunks.

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::path::Path;

use crate::error::WireError;

const PKCS1_V15_OVERHEAD: usize = 11;

/// Agent side: encrypts with the server's public key.
#[derive(Clone)]
pub struct Encryptor {
    key: RsaPublicKey,
}

impl Encryptor {
    /// Accepts a `PUBLIC KEY` (SPKI) or `RSA PUBLIC KEY` (PKCS#1) PEM block.
    pub fn from_pem(pem: &str) -> Result<Self, WireError> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| WireError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WireError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, WireError> {
        let block = self.key.size();
        let chunk = block - PKCS1_V15_OVERHEAD;
        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(plaintext.len().div_ceil(chunk).max(1) * block);
        for part in plaintext.chunks(chunk) {
            let sealed = self
                .key
                .encrypt(&mut rng, Pkcs1v15Encrypt, part)
                .map_err(|e| WireError::Encrypt(e.to_string()))?;
            out.extend_from_slice(&sealed);
        }
        Ok(out)
    }
}

/// Server side: decrypts with the matching private key.
#[derive(Clone)]
pub struct Decryptor {
    key: RsaPrivateKey,
}

impl Decryptor {
    /// Accepts an `RSA PRIVATE KEY` (PKCS#1) or `PRIVATE KEY` (PKCS#8) PEM
    /// block.
    pub fn from_pem(pem: &str) -> Result<Self, WireError> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| WireError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WireError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, WireError> {
        let block = self.key.size();
        if ciphertext.is_empty() || ciphertext.len() % block != 0 {
            return Err(WireError::Decrypt(format!(
                "ciphertext length {} is not a multiple of the {block}-byte block",
                ciphertext.len()
            )));
        }
        let mut out = Vec::with_capacity(ciphertext.len());
        for sealed in ciphertext.chunks(block) {
            let part = self
                .key
                .decrypt(Pkcs1v15Encrypt, sealed)
                .map_err(|e| WireError::Decrypt(e.to_string()))?;
            out.extend_from_slice(&part);
        }
        Ok(out)
    }
}

fn read_pem(path: &Path) -> Result<String, WireError> {
    std::fs::read_to_string(path)
        .map_err(|e| WireError::InvalidKey(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};

    fn key_pair() -> (Encryptor, Decryptor) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let private_pem = private.to_pkcs1_pem(LineEnding::LF).unwrap();
        (
            Encryptor::from_pem(&public_pem).unwrap(),
            Decryptor::from_pem(&private_pem).unwrap(),
        )
    }

    #[test]
    fn payload_larger_than_one_block() {
        let (enc, dec) = key_pair();
        // 1024-bit key: 117 bytes of plaintext per 128-byte block.
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let sealed = enc.encrypt(&payload).unwrap();
        assert_eq!(sealed.len(), 1000usize.div_ceil(117) * 128);
        assert_eq!(dec.decrypt(&sealed).unwrap(), payload);
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let (enc, dec) = key_pair();
        let sealed = enc.encrypt(b"hello").unwrap();
        assert!(matches!(
            dec.decrypt(&sealed[..sealed.len() - 1]),
            Err(WireError::Decrypt(_))
        ));
    }

    #[test]
    fn foreign_key_cannot_decrypt() {
        let (enc, _) = key_pair();
        let (_, other) = key_pair();
        let sealed = enc.encrypt(b"hello").unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(matches!(
            Encryptor::from_pem("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n"),
            Err(WireError::InvalidKey(_))
        ));
        assert!(Decryptor::from_file("/nonexistent/key.pem").is_err());
    }
}
