//! Session key derivation.
//!
//! Uses HKDF (HMAC-based Key Derivation Function) with SHA-256 to turn the
//! raw Diffie-Hellman shared secret into the session key. The client's
//! handshake nonce is used as the extraction salt so that each session
//! derives a distinct key even under key reuse by a misbehaving client.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::{AeadKey, SharedSecret, KEY_SIZE};
use crate::error::{Error, Result};

/// Domain-separation info string for session key derivation.
const SESSION_INFO: &[u8] = b"reflex-session";

/// Derive the 32-byte session key from a DH shared secret.
///
/// `salt` is the 16-byte client handshake nonce. Both peers call this with
/// identical inputs and obtain identical keys.
pub fn derive_session_key(shared: &SharedSecret, salt: &[u8]) -> Result<AeadKey> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(SESSION_INFO, &mut okm)
        .map_err(|_| Error::crypto("HKDF expansion failed"))?;
    Ok(AeadKey::from_bytes(okm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EphemeralSecret, PublicKey};

    fn shared_pair() -> (SharedSecret, SharedSecret) {
        let a = EphemeralSecret::random();
        let a_pub = PublicKey::from(&a);
        let b = EphemeralSecret::random();
        let b_pub = PublicKey::from(&b);
        (
            a.diffie_hellman(&b_pub).unwrap(),
            b.diffie_hellman(&a_pub).unwrap(),
        )
    }

    #[test]
    fn test_both_sides_derive_same_key() {
        let (shared_a, shared_b) = shared_pair();
        let salt = b"1234567890123456";

        let key_a = derive_session_key(&shared_a, salt).unwrap();
        let key_b = derive_session_key(&shared_b, salt).unwrap();

        assert_eq!(key_a.as_bytes(), key_b.as_bytes());
    }

    #[test]
    fn test_salt_separates_sessions() {
        let (shared, _) = shared_pair();

        let key1 = derive_session_key(&shared, b"1111111111111111").unwrap();
        let key2 = derive_session_key(&shared, b"2222222222222222").unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }
}
