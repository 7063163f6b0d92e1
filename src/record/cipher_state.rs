//! Per-direction key material and sequence counters.
//!
//! A [`CipherState`] holds the AES key, the MAC key and the sequence number
//! for one traffic direction. States are replaced wholesale on rekey; the only
//! field that ever changes in place is the sequence counter, which advances by
//! exactly one per record and never wraps.

// Rust guideline compliant 2026-02

use zeroize::Zeroizing;

use crate::constants::{KEY_EXPANSION_LABEL, KEY_SIZE, MAC_SIZE};
use crate::crypto::CryptoService;
use crate::error::{Result, SessionError};

/// Which end of the session this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates handshakes, writes with the client keys.
    Client,
    /// Answers handshakes, writes with the server keys.
    Server,
}

/// Key material for one traffic direction.
#[derive(Default)]
pub struct CipherState {
    key: Zeroizing<Vec<u8>>,
    mac_key: Zeroizing<Vec<u8>>,
    sequence_number: u64,
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("initialized", &self.initialized())
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

impl CipherState {
    /// Create a keyed state with a zero sequence number.
    pub fn new(key: &[u8], mac_key: &[u8]) -> Self {
        Self {
            key: Zeroizing::new(key.to_vec()),
            mac_key: Zeroizing::new(mac_key.to_vec()),
            sequence_number: 0,
        }
    }

    /// `true` iff both the key and the MAC key are present.
    pub fn initialized(&self) -> bool {
        !self.key.is_empty() && !self.mac_key.is_empty()
    }

    /// Number of records processed in this direction so far.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    fn associated_data(&self, content_type: u8) -> Result<[u8; 9]> {
        if self.sequence_number == u64::MAX {
            return Err(SessionError::Protocol("sequence number exhausted".into()));
        }
        let mut aad = [0u8; 9];
        aad[..8].copy_from_slice(&self.sequence_number.to_be_bytes());
        aad[8] = content_type;
        Ok(aad)
    }

    /// Encrypt and MAC one record body, then advance the sequence number.
    pub fn encrypt(
        &mut self,
        crypto: &dyn CryptoService,
        content_type: u8,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let aad = self.associated_data(content_type)?;
        let sealed = crypto.aes256_cbc_hmac_encrypt(plaintext, &self.key, &self.mac_key, &aad)?;
        self.sequence_number += 1;
        Ok(sealed)
    }

    /// Verify and decrypt one record body, then advance the sequence number.
    ///
    /// A MAC failure means tampering, replay, loss or reordering; all are
    /// reported as fatal protocol errors.
    pub fn decrypt(
        &mut self,
        crypto: &dyn CryptoService,
        content_type: u8,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let aad = self.associated_data(content_type)?;
        let plaintext = crypto
            .aes256_cbc_hmac_decrypt(data, &self.key, &self.mac_key, &aad)
            .map_err(|e| {
                SessionError::Protocol(format!(
                    "record {} rejected: {e}",
                    self.sequence_number
                ))
            })?;
        self.sequence_number += 1;
        Ok(plaintext)
    }

    #[cfg(test)]
    pub(crate) fn with_sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = sequence_number;
        self
    }
}

/// A matching read/write pair.
#[derive(Debug, Default)]
pub struct CipherPair {
    /// State for inbound records.
    pub read: CipherState,
    /// State for outbound records.
    pub write: CipherState,
}

/// Derive a fresh read/write pair from a master secret and both randoms.
///
/// Both peers run the same derivation; the client writes with the client
/// half and the server with the server half, so the pairs line up without
/// any key ever crossing the wire.
pub fn get_fresh_rw_states(
    crypto: &dyn CryptoService,
    master_secret: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    role: Role,
) -> Result<CipherPair> {
    if master_secret.is_empty() {
        return Err(SessionError::InvalidState(
            "cannot derive cipher states from an empty master secret".into(),
        ));
    }
    let mut salt = Vec::with_capacity(client_random.len() + server_random.len());
    salt.extend_from_slice(client_random);
    salt.extend_from_slice(server_random);

    let block = Zeroizing::new(crypto.hkdf_sha256(
        master_secret,
        &salt,
        KEY_EXPANSION_LABEL,
        2 * (MAC_SIZE + KEY_SIZE),
    )?);
    let (client_mac, rest) = block.split_at(MAC_SIZE);
    let (server_mac, rest) = rest.split_at(MAC_SIZE);
    let (client_key, server_key) = rest.split_at(KEY_SIZE);

    let client = CipherState::new(client_key, client_mac);
    let server = CipherState::new(server_key, server_mac);
    Ok(match role {
        Role::Client => CipherPair {
            read: server,
            write: client,
        },
        Role::Server => CipherPair {
            read: client,
            write: server,
        },
    })
}
