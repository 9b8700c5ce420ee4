//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Uses ChaCha20-Poly1305 for symmetric encryption with authentication.
//! This cipher is:
//! - Fast in software (no hardware AES required)
//! - Constant-time (resistant to timing attacks)
//! - Widely deployed (TLS 1.3, WireGuard, etc.)
//!
//! Reflex frames carry no associated data, so the wrapper seals and opens
//! bare plaintexts.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{KEY_SIZE, NONCE_SIZE};
use crate::error::{Error, Result};

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for AeadKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A nonce (number used once) for AEAD operations.
///
/// Frame nonces are counter-derived: four zero bytes followed by the
/// big-endian 64-bit frame counter. A nonce is unique per key per
/// direction as long as the counter never repeats.
#[derive(Clone, Copy, Debug)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from a 64-bit frame counter.
    ///
    /// The counter occupies the last 8 bytes (big-endian); the first
    /// 4 bytes are zero.
    pub fn from_counter(counter: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[4..12].copy_from_slice(&counter.to_be_bytes());
        Self(nonce)
    }

    /// Create a nonce from raw bytes (e.g. a random handshake grant nonce).
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl From<u64> for Nonce {
    fn from(counter: u64) -> Self {
        Self::from_counter(counter)
    }
}

/// ChaCha20-Poly1305 AEAD cipher.
pub struct Aead {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for Aead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aead").finish_non_exhaustive()
    }
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt plaintext, returning ciphertext with the 16-byte tag appended.
    ///
    /// The nonce must be unique for this key.
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(nonce.as_bytes().into(), plaintext)
            .map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt ciphertext produced by [`Aead::seal`].
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails (wrong key, wrong nonce,
    /// tampered data).
    pub fn open(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(nonce.as_bytes().into(), ciphertext)
            .map_err(|_| Error::crypto("decryption/authentication failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TAG_SIZE;

    fn test_key() -> AeadKey {
        let mut bytes = [0u8; KEY_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        AeadKey::from_bytes(bytes)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::from_counter(1);

        let plaintext = b"Hello, World!";
        let ciphertext = aead.seal(&nonce, plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);

        let decrypted = aead.open(&nonce, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let aead1 = Aead::new(&test_key());
        let aead2 = Aead::new(&AeadKey::from_bytes([0x42u8; KEY_SIZE]));
        let nonce = Nonce::from_counter(1);

        let ciphertext = aead1.seal(&nonce, b"secret data").unwrap();
        assert!(aead2.open(&nonce, &ciphertext).is_err());
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let aead = Aead::new(&test_key());

        let ciphertext = aead.seal(&Nonce::from_counter(1), b"secret data").unwrap();
        assert!(aead.open(&Nonce::from_counter(2), &ciphertext).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::from_counter(1);

        let mut ciphertext = aead.seal(&nonce, b"secret data").unwrap();
        ciphertext[0] ^= 0x01; // Flip one bit

        assert!(aead.open(&nonce, &ciphertext).is_err());
    }

    #[test]
    fn test_counter_nonce_layout() {
        let nonce = Nonce::from_counter(0x0102030405060708);
        assert_eq!(&nonce.as_bytes()[..4], &[0, 0, 0, 0]);
        assert_eq!(
            &nonce.as_bytes()[4..],
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }
}
