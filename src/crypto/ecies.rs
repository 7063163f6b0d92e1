//! Hybrid public-key encryption (ECIES) for out-of-band payloads.
//!
//! Not used by live handshakes. Key material:
//!
//! ```text
//! shared = ECDH(local_private, peer_public)          (32 bytes)
//! E || M = SHA-512(shared)                          (E = enc key, M = mac key)
//! ```
//!
//! Message format:
//!
//! ```text
//! iv = HMAC-SHA256(local_private, plaintext)[0..16]
//! ciphertext = iv || AES-256-CBC-PKCS7(plaintext, E, iv)
//! output = ciphertext || HMAC-SHA256(M, ciphertext)[0..4]
//! ```
//!
//! The 4-byte tag is verified before decryption is attempted.
//!
//! Rust guideline compliant 2026-01

use std::sync::Arc;

use zeroize::Zeroizing;

use super::CryptoService;
use crate::constants::IV_SIZE;
use crate::error::{Result, SessionError};

/// Length of the truncated integrity tag.
const TAG_SIZE: usize = 4;

/// Length of a compressed P-256 public key (sealed-box prefix).
const COMPRESSED_POINT_SIZE: usize = 33;

/// ECIES context bound to one local private key and one peer public key.
pub struct Ecies {
    crypto: Arc<dyn CryptoService>,
    private_key: Zeroizing<Vec<u8>>,
    enc_key: Zeroizing<Vec<u8>>,
    mac_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for Ecies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ecies").finish_non_exhaustive()
    }
}

impl Ecies {
    /// Derive encryption and MAC keys from `private_key` and `peer_public`.
    pub fn new(
        crypto: Arc<dyn CryptoService>,
        private_key: &[u8],
        peer_public: &[u8],
    ) -> Result<Self> {
        let shared = crypto.ec_shared_secret(private_key, peer_public)?;
        let digest = Zeroizing::new(crypto.sha512(&shared));
        let (enc, mac) = digest.split_at(digest.len() / 2);
        Ok(Self {
            private_key: Zeroizing::new(private_key.to_vec()),
            enc_key: Zeroizing::new(enc.to_vec()),
            mac_key: Zeroizing::new(mac.to_vec()),
            crypto,
        })
    }

    /// Encrypt `plaintext` for the peer.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let iv_source = self.crypto.hmac_sha256(&self.private_key, plaintext)?;
        let iv = &iv_source[..IV_SIZE];

        let mut out = Vec::with_capacity(IV_SIZE + plaintext.len() + 16 + TAG_SIZE);
        out.extend_from_slice(iv);
        out.extend(self.crypto.aes256_cbc_encrypt(plaintext, &self.enc_key, iv)?);

        let tag = self.crypto.hmac_sha256(&self.mac_key, &out)?;
        out.extend_from_slice(&tag[..TAG_SIZE]);
        Ok(out)
    }

    /// Verify the tag and decrypt a message produced by the peer.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < IV_SIZE + 16 + TAG_SIZE {
            return Err(SessionError::Crypto(format!(
                "ECIES message too short: {} bytes",
                data.len()
            )));
        }
        let (ciphertext, tag) = data.split_at(data.len() - TAG_SIZE);
        let expected = self.crypto.hmac_sha256(&self.mac_key, ciphertext)?;
        if !super::constant_time_eq(&expected[..TAG_SIZE], tag) {
            return Err(SessionError::Crypto("ECIES MAC verification failed".into()));
        }

        let (iv, body) = ciphertext.split_at(IV_SIZE);
        self.crypto.aes256_cbc_decrypt(body, &self.enc_key, iv)
    }

    /// Encrypt for `recipient_public` under a fresh ephemeral key.
    ///
    /// Output: `ephemeral_public(33) || encrypt(plaintext)`.
    pub fn seal(
        crypto: &Arc<dyn CryptoService>,
        recipient_public: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let ephemeral = crypto.ec_generate_key()?;
        let ecies = Self::new(Arc::clone(crypto), &ephemeral.private_key, recipient_public)?;
        let mut out = ephemeral.public_key.clone();
        out.extend(ecies.encrypt(plaintext)?);
        Ok(out)
    }

    /// Decrypt a [`Ecies::seal`] output with the recipient's private key.
    pub fn open(
        crypto: &Arc<dyn CryptoService>,
        recipient_private: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>> {
        if sealed.len() < COMPRESSED_POINT_SIZE {
            return Err(SessionError::Crypto("sealed box too short".into()));
        }
        let (ephemeral_public, body) = sealed.split_at(COMPRESSED_POINT_SIZE);
        Self::new(Arc::clone(crypto), recipient_private, ephemeral_public)?.decrypt(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCryptoService;

    fn crypto() -> Arc<dyn CryptoService> {
        Arc::new(DefaultCryptoService)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let crypto = crypto();
        let recipient = crypto.ec_generate_key().unwrap();
        let sealed = Ecies::seal(&crypto, &recipient.public_key, b"out-of-band secret").unwrap();
        let opened = Ecies::open(&crypto, &recipient.private_key, &sealed).unwrap();
        assert_eq!(opened, b"out-of-band secret");
    }

    #[test]
    fn test_wrong_private_key_fails_mac() {
        let crypto = crypto();
        let recipient = crypto.ec_generate_key().unwrap();
        let intruder = crypto.ec_generate_key().unwrap();
        let sealed = Ecies::seal(&crypto, &recipient.public_key, b"payload").unwrap();

        let err = Ecies::open(&crypto, &intruder.private_key, &sealed).unwrap_err();
        assert_eq!(err, SessionError::Crypto("ECIES MAC verification failed".into()));
    }

    #[test]
    fn test_bidirectional_context() {
        let crypto = crypto();
        let alice = crypto.ec_generate_key().unwrap();
        let bob = crypto.ec_generate_key().unwrap();

        let to_bob = Ecies::new(Arc::clone(&crypto), &alice.private_key, &bob.public_key).unwrap();
        let from_alice =
            Ecies::new(Arc::clone(&crypto), &bob.private_key, &alice.public_key).unwrap();

        let ciphertext = to_bob.encrypt(b"hello bob").unwrap();
        assert_eq!(from_alice.decrypt(&ciphertext).unwrap(), b"hello bob");
    }

    #[test]
    fn test_deterministic_iv_for_same_plaintext() {
        let crypto = crypto();
        let alice = crypto.ec_generate_key().unwrap();
        let bob = crypto.ec_generate_key().unwrap();
        let ecies = Ecies::new(Arc::clone(&crypto), &alice.private_key, &bob.public_key).unwrap();

        assert_eq!(ecies.encrypt(b"same").unwrap(), ecies.encrypt(b"same").unwrap());
        assert_ne!(ecies.encrypt(b"same").unwrap(), ecies.encrypt(b"other").unwrap());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let crypto = crypto();
        let recipient = crypto.ec_generate_key().unwrap();
        let mut sealed = Ecies::seal(&crypto, &recipient.public_key, b"payload").unwrap();
        sealed[40] ^= 0x01;
        assert!(Ecies::open(&crypto, &recipient.private_key, &sealed).is_err());
    }
}
