//! Cryptographic primitives consumed by the session layer.
//!
//! The record layer, key agreements and ECIES never touch a primitive
//! implementation directly. They go through the [`CryptoService`] trait so the
//! backend can be swapped (hardware module, platform crypto, test doubles).
//! [`DefaultCryptoService`] is the RustCrypto-backed implementation.
//!
//! # Record cipher
//!
//! [`CryptoService::aes256_cbc_hmac_encrypt`] produces the keyed record body:
//!
//! ```text
//! [iv: 16] [AES-256-CBC-PKCS7 ciphertext] [HMAC-SHA256(mac_key, aad || iv || ciphertext): 32]
//! ```

pub mod ecies;

use std::fmt;

use aes::cipher::{
    block_padding::Pkcs7, generic_array::GenericArray, BlockDecrypt, BlockDecryptMut,
    BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::constants::{IV_SIZE, MAC_SIZE};
use crate::error::{Result, SessionError};

pub use ecies::Ecies;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// AES block size.
const BLOCK_SIZE: usize = 16;

/// An elliptic-curve key pair (P-256).
pub struct EcKeyPair {
    /// 32-byte big-endian private scalar, zeroed on drop.
    pub private_key: Zeroizing<Vec<u8>>,
    /// 33-byte compressed SEC1 public point.
    pub public_key: Vec<u8>,
}

impl fmt::Debug for EcKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcKeyPair")
            .field("public_key_len", &self.public_key.len())
            .finish_non_exhaustive()
    }
}

/// Opaque provider of the primitives the session layer needs.
///
/// Implementations must be thread-safe; one instance is shared by every
/// session of a [`crate::SessionManager`].
pub trait CryptoService: Send + Sync + fmt::Debug {
    /// Fill a fresh buffer with cryptographically secure random bytes.
    fn random_bytes(&self, len: usize) -> Vec<u8>;

    /// SHA-1 digest.
    fn sha1(&self, data: &[u8]) -> Vec<u8>;

    /// SHA-256 digest.
    fn sha256(&self, data: &[u8]) -> Vec<u8>;

    /// SHA-512 digest.
    fn sha512(&self, data: &[u8]) -> Vec<u8>;

    /// HMAC-SHA256.
    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// HMAC-SHA512.
    fn hmac_sha512(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// AES-256-ECB without padding. `data` must be a multiple of 16 bytes.
    fn aes256_ecb_encrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>>;

    /// Inverse of [`CryptoService::aes256_ecb_encrypt`].
    fn aes256_ecb_decrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>>;

    /// AES-256-CBC with PKCS7 padding.
    fn aes256_cbc_encrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>>;

    /// AES-256-CBC with PKCS7 padding removal.
    fn aes256_cbc_decrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>>;

    /// PBKDF2-HMAC-SHA512.
    fn pbkdf2_sha512(&self, password: &[u8], salt: &[u8], rounds: u32, len: usize) -> Vec<u8>;

    /// HKDF-SHA256 extract-and-expand.
    fn hkdf_sha256(&self, ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>>;

    /// Generate a fresh P-256 key pair.
    fn ec_generate_key(&self) -> Result<EcKeyPair>;

    /// Compressed public point for a private scalar.
    fn ec_public_key(&self, private_key: &[u8]) -> Result<Vec<u8>>;

    /// ECDH: x coordinate of `private_key * peer_public`, fixed 32-byte width.
    fn ec_shared_secret(&self, private_key: &[u8], peer_public: &[u8])
        -> Result<Zeroizing<Vec<u8>>>;

    /// AES-256-CBC + HMAC-SHA256 with a random IV prefix and full-length tag.
    ///
    /// `aad` is authenticated but not transmitted.
    fn aes256_cbc_hmac_encrypt(
        &self,
        data: &[u8],
        key: &[u8],
        mac_key: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        let iv = self.random_bytes(IV_SIZE);
        let ciphertext = self.aes256_cbc_encrypt(data, key, &iv)?;

        let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len() + MAC_SIZE);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);

        let mut mac_input = Vec::with_capacity(aad.len() + out.len());
        mac_input.extend_from_slice(aad);
        mac_input.extend_from_slice(&out);
        let tag = self.hmac_sha256(mac_key, &mac_input)?;
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verify the tag, then decrypt. The tag is checked before any decryption.
    fn aes256_cbc_hmac_decrypt(
        &self,
        data: &[u8],
        key: &[u8],
        mac_key: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        if data.len() < IV_SIZE + BLOCK_SIZE + MAC_SIZE {
            return Err(SessionError::Crypto(format!(
                "ciphertext too short: {} bytes",
                data.len()
            )));
        }
        let (body, tag) = data.split_at(data.len() - MAC_SIZE);

        let mut mac_input = Vec::with_capacity(aad.len() + body.len());
        mac_input.extend_from_slice(aad);
        mac_input.extend_from_slice(body);
        let expected = self.hmac_sha256(mac_key, &mac_input)?;
        if !constant_time_eq(&expected, tag) {
            return Err(SessionError::Crypto("MAC verification failed".into()));
        }

        let (iv, ciphertext) = body.split_at(IV_SIZE);
        self.aes256_cbc_decrypt(ciphertext, key, iv)
    }
}

/// Compare two byte strings without early exit.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// RustCrypto-backed [`CryptoService`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCryptoService;

impl DefaultCryptoService {
    fn secret_key(private_key: &[u8]) -> Result<p256::SecretKey> {
        p256::SecretKey::from_slice(private_key)
            .map_err(|e| SessionError::Crypto(format!("invalid P-256 private key: {e}")))
    }

    fn check_block_multiple(data: &[u8]) -> Result<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(SessionError::Crypto(format!(
                "ECB input must be a multiple of {BLOCK_SIZE} bytes, got {}",
                data.len()
            )));
        }
        Ok(())
    }

    fn aes256(key: &[u8]) -> Result<aes::Aes256> {
        aes::Aes256::new_from_slice(key)
            .map_err(|e| SessionError::Crypto(format!("invalid AES-256 key: {e}")))
    }
}

impl CryptoService for DefaultCryptoService {
    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::rng().fill_bytes(&mut buf);
        buf
    }

    fn sha1(&self, data: &[u8]) -> Vec<u8> {
        Sha1::digest(data).to_vec()
    }

    fn sha256(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn sha512(&self, data: &[u8]) -> Vec<u8> {
        Sha512::digest(data).to_vec()
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|e| SessionError::Crypto(format!("invalid HMAC key: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn hmac_sha512(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = <HmacSha512 as Mac>::new_from_slice(key)
            .map_err(|e| SessionError::Crypto(format!("invalid HMAC key: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn aes256_ecb_encrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        Self::check_block_multiple(data)?;
        let cipher = Self::aes256(key)?;
        let mut out = data.to_vec();
        for block in out.chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(out)
    }

    fn aes256_ecb_decrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        Self::check_block_multiple(data)?;
        let cipher = Self::aes256(key)?;
        let mut out = data.to_vec();
        for block in out.chunks_exact_mut(BLOCK_SIZE) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(out)
    }

    fn aes256_cbc_encrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|e| SessionError::Crypto(format!("invalid AES-CBC key/iv: {e}")))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
    }

    fn aes256_cbc_decrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| SessionError::Crypto(format!("invalid AES-CBC key/iv: {e}")))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|e| SessionError::Crypto(format!("AES-CBC decryption failed: {e}")))
    }

    fn pbkdf2_sha512(&self, password: &[u8], salt: &[u8], rounds: u32, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, rounds, &mut out);
        out
    }

    fn hkdf_sha256(&self, ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = vec![0u8; len];
        hk.expand(info, &mut okm)
            .map_err(|e| SessionError::Crypto(format!("HKDF expansion failed: {e}")))?;
        Ok(okm)
    }

    fn ec_generate_key(&self) -> Result<EcKeyPair> {
        // A uniformly random 32-byte string is a valid scalar except with
        // negligible probability (zero or >= group order); retry in that case.
        for _ in 0..8 {
            let candidate = Zeroizing::new(self.random_bytes(32));
            if let Ok(secret) = p256::SecretKey::from_slice(&candidate) {
                let public_key = secret
                    .public_key()
                    .to_encoded_point(true)
                    .as_bytes()
                    .to_vec();
                return Ok(EcKeyPair {
                    private_key: candidate,
                    public_key,
                });
            }
        }
        Err(SessionError::Crypto("failed to generate P-256 key".into()))
    }

    fn ec_public_key(&self, private_key: &[u8]) -> Result<Vec<u8>> {
        let secret = Self::secret_key(private_key)?;
        Ok(secret
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec())
    }

    fn ec_shared_secret(
        &self,
        private_key: &[u8],
        peer_public: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let secret = Self::secret_key(private_key)?;
        let public = p256::PublicKey::from_sec1_bytes(peer_public)
            .map_err(|e| SessionError::Crypto(format!("invalid P-256 public key: {e}")))?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_lengths() {
        let crypto = DefaultCryptoService;
        assert_eq!(crypto.sha1(b"abc").len(), 20);
        assert_eq!(crypto.sha256(b"abc").len(), 32);
        assert_eq!(crypto.sha512(b"abc").len(), 64);
    }

    #[test]
    fn test_sha256_known_vector() {
        let digest = DefaultCryptoService.sha256(b"abc");
        assert_eq!(
            digest[..4],
            [0xba, 0x78, 0x16, 0xbf],
            "SHA-256('abc') starts with ba7816bf"
        );
    }

    #[test]
    fn test_cbc_roundtrip_and_padding() {
        let crypto = DefaultCryptoService;
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let ciphertext = crypto.aes256_cbc_encrypt(b"sixteen byte msg", &key, &iv).unwrap();
        assert_eq!(ciphertext.len(), 32, "full block of PKCS7 padding appended");
        let plaintext = crypto.aes256_cbc_decrypt(&ciphertext, &key, &iv).unwrap();
        assert_eq!(plaintext, b"sixteen byte msg");
    }

    #[test]
    fn test_ecb_requires_block_multiple() {
        let crypto = DefaultCryptoService;
        assert!(crypto.aes256_ecb_encrypt(b"short", &[0u8; 32]).is_err());
        let block = crypto.aes256_ecb_encrypt(&[1u8; 32], &[0u8; 32]).unwrap();
        assert_eq!(crypto.aes256_ecb_decrypt(&block, &[0u8; 32]).unwrap(), [1u8; 32]);
    }

    #[test]
    fn test_cbc_hmac_roundtrip() {
        let crypto = DefaultCryptoService;
        let sealed = crypto
            .aes256_cbc_hmac_encrypt(b"payload", &[1u8; 32], &[2u8; 32], b"aad")
            .unwrap();
        let opened = crypto
            .aes256_cbc_hmac_decrypt(&sealed, &[1u8; 32], &[2u8; 32], b"aad")
            .unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn test_cbc_hmac_rejects_wrong_aad() {
        let crypto = DefaultCryptoService;
        let sealed = crypto
            .aes256_cbc_hmac_encrypt(b"payload", &[1u8; 32], &[2u8; 32], b"seq-1")
            .unwrap();
        let err = crypto
            .aes256_cbc_hmac_decrypt(&sealed, &[1u8; 32], &[2u8; 32], b"seq-2")
            .unwrap_err();
        assert!(matches!(err, SessionError::Crypto(_)));
    }

    #[test]
    fn test_ecdh_shared_secret_matches() {
        let crypto = DefaultCryptoService;
        let alice = crypto.ec_generate_key().unwrap();
        let bob = crypto.ec_generate_key().unwrap();
        assert_eq!(alice.public_key.len(), 33);

        let ab = crypto.ec_shared_secret(&alice.private_key, &bob.public_key).unwrap();
        let ba = crypto.ec_shared_secret(&bob.private_key, &alice.public_key).unwrap();
        assert_eq!(*ab, *ba);
        assert_eq!(ab.len(), 32);
    }

    #[test]
    fn test_ec_public_key_matches_generated() {
        let crypto = DefaultCryptoService;
        let pair = crypto.ec_generate_key().unwrap();
        assert_eq!(crypto.ec_public_key(&pair.private_key).unwrap(), pair.public_key);
    }

    #[test]
    fn test_invalid_public_key_rejected() {
        let crypto = DefaultCryptoService;
        let pair = crypto.ec_generate_key().unwrap();
        assert!(crypto.ec_shared_secret(&pair.private_key, &[0x02; 10]).is_err());
    }

    #[test]
    fn test_pbkdf2_is_deterministic() {
        let crypto = DefaultCryptoService;
        let a = crypto.pbkdf2_sha512(b"pw", b"salt", 10, 32);
        let b = crypto.pbkdf2_sha512(b"pw", b"salt", 10, 32);
        assert_eq!(a, b);
        assert_ne!(a, crypto.pbkdf2_sha512(b"pw", b"salt2", 10, 32));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
