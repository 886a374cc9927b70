//! KLAP handshake derivations and the sequence-signed stream cipher.
//!
//! ## Handshake
//! ```text
//! -> /handshake1   local_seed(16)
//! <-               remote_seed(16) || SHA256(local || remote || auth)
//! -> /handshake2   SHA256(remote || local || auth)
//! ```
//!
//! Once both hashes agree, [`KlapCipher`] derives the AES key, IV base,
//! initial sequence and signature base from the seeds and the matched auth
//! hash. Each request advances the sequence by one and is sent as
//! `SHA256(sig || seq || ct) || ct`.

use crate::crypto::{aes_cbc_decrypt, aes_cbc_encrypt, sha1, sha256, AES_KEY_LENGTH};
use crate::error::{ProtocolError, Result};
use crate::messages::Credential;

/// Length of the local and remote handshake seeds.
pub const SEED_LENGTH: usize = 16;

/// Length of a SHA-256 handshake hash.
pub const HASH_LENGTH: usize = 32;

/// Length of the signature prefix on every encrypted payload.
pub const SIGNATURE_LENGTH: usize = 32;

/// Bytes of the derived IV hash used as the fixed IV prefix.
pub const IV_BASE_LENGTH: usize = 12;

/// Bytes of the derived `ldk` hash kept as the signature base.
pub const SIGNATURE_BASE_LENGTH: usize = 28;

/// Username of the credential accepted by devices in onboarding state.
pub const TEST_USERNAME: &str = "test@tp-link.net";

/// Password of the credential accepted by devices in onboarding state.
pub const TEST_PASSWORD: &str = "test";

/// Progress of the two-phase KLAP handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KlapHandshakePhase {
    /// No handshake has been attempted, or the session was invalidated.
    #[default]
    NoSession,
    /// The local seed has been posted to `/handshake1`.
    Handshake1Sent,
    /// The confirmation hash has been posted to `/handshake2`.
    Handshake2Sent,
    /// Both phases succeeded; requests may be encrypted.
    Established,
}

/// `SHA256(SHA1(username) || SHA1(password))`.
pub fn auth_hash(username: &str, password: &str) -> [u8; HASH_LENGTH] {
    sha256(&[&sha1(username.as_bytes()), &sha1(password.as_bytes())])
}

/// Auth hashes tried during handshake1, in order: the real credential, a
/// blank credential and the vendor test credential.
pub fn auth_hash_candidates(credential: &Credential) -> [[u8; HASH_LENGTH]; 3] {
    [
        auth_hash(&credential.username, &credential.password),
        auth_hash("", ""),
        auth_hash(TEST_USERNAME, TEST_PASSWORD),
    ]
}

/// Hash the device returns from handshake1.
pub fn handshake1_hash(local_seed: &[u8], remote_seed: &[u8], auth: &[u8]) -> [u8; HASH_LENGTH] {
    sha256(&[local_seed, remote_seed, auth])
}

/// Hash the client posts to handshake2.
pub fn handshake2_hash(local_seed: &[u8], remote_seed: &[u8], auth: &[u8]) -> [u8; HASH_LENGTH] {
    sha256(&[remote_seed, local_seed, auth])
}

/// Returns the first candidate whose handshake1 hash equals `server_hash`.
pub fn match_auth_hash(
    local_seed: &[u8],
    remote_seed: &[u8],
    server_hash: &[u8],
    candidates: &[[u8; HASH_LENGTH]],
) -> Option<[u8; HASH_LENGTH]> {
    candidates
        .iter()
        .find(|auth| handshake1_hash(local_seed, remote_seed, auth.as_slice()) == server_hash)
        .copied()
}

/// Splits a handshake1 reply into the remote seed and the server hash.
pub fn split_handshake1_reply(body: &[u8]) -> Result<(&[u8], &[u8])> {
    if body.len() != SEED_LENGTH + HASH_LENGTH {
        return Err(ProtocolError::Deserialization(format!(
            "handshake1 reply is {} bytes, expected {}",
            body.len(),
            SEED_LENGTH + HASH_LENGTH
        )));
    }
    Ok(body.split_at(SEED_LENGTH))
}

/// Per-session KLAP cipher.
///
/// The sequence is a signed 32-bit counter that wraps. A new handshake
/// produces a new cipher and therefore resets it.
#[derive(Clone)]
pub struct KlapCipher {
    key: [u8; AES_KEY_LENGTH],
    iv_base: [u8; IV_BASE_LENGTH],
    sequence: i32,
    signature_base: [u8; SIGNATURE_BASE_LENGTH],
}

impl KlapCipher {
    /// Derives the cipher from both seeds and the matched auth hash.
    pub fn new(local_seed: &[u8], remote_seed: &[u8], auth: &[u8]) -> Self {
        let key_hash = sha256(&[b"lsk", local_seed, remote_seed, auth]);
        let iv_hash = sha256(&[b"iv", local_seed, remote_seed, auth]);
        let sig_hash = sha256(&[b"ldk", local_seed, remote_seed, auth]);

        let mut key = [0u8; AES_KEY_LENGTH];
        key.copy_from_slice(&key_hash[..AES_KEY_LENGTH]);
        let mut iv_base = [0u8; IV_BASE_LENGTH];
        iv_base.copy_from_slice(&iv_hash[..IV_BASE_LENGTH]);
        let mut seq_bytes = [0u8; 4];
        seq_bytes.copy_from_slice(&iv_hash[HASH_LENGTH - 4..]);
        let mut signature_base = [0u8; SIGNATURE_BASE_LENGTH];
        signature_base.copy_from_slice(&sig_hash[..SIGNATURE_BASE_LENGTH]);

        Self {
            key,
            iv_base,
            sequence: i32::from_be_bytes(seq_bytes),
            signature_base,
        }
    }

    /// Sequence number of the most recently encrypted message.
    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    fn iv_for(&self, sequence: i32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..IV_BASE_LENGTH].copy_from_slice(&self.iv_base);
        iv[IV_BASE_LENGTH..].copy_from_slice(&sequence.to_be_bytes());
        iv
    }

    fn signature(&self, sequence: i32, ciphertext: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        sha256(&[&self.signature_base, &sequence.to_be_bytes(), ciphertext])
    }

    /// Advances the sequence and encrypts `plaintext` under it.
    ///
    /// Returns the signed payload and the sequence it was sealed with, which
    /// the caller sends as the `seq` query parameter.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Vec<u8>, i32)> {
        self.sequence = self.sequence.wrapping_add(1);
        let payload = self.seal(self.sequence, plaintext)?;
        Ok((payload, self.sequence))
    }

    /// Decrypts a reply to the most recently encrypted message.
    ///
    /// Fails when the signature prefix was not made under the current
    /// sequence, so a reply to an earlier request is never returned.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > SIGNATURE_LENGTH && !self.verify(self.sequence, payload) {
            return Err(ProtocolError::Decryption(format!(
                "klap signature does not match sequence {}",
                self.sequence
            )));
        }
        self.open(self.sequence, payload)
    }

    /// Signs and encrypts `plaintext` under an explicit sequence number.
    pub fn seal(&self, sequence: i32, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = aes_cbc_encrypt(&self.key, &self.iv_for(sequence), plaintext)?;
        let mut payload = Vec::with_capacity(SIGNATURE_LENGTH + ciphertext.len());
        payload.extend_from_slice(&self.signature(sequence, &ciphertext));
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    /// Strips the signature and decrypts under an explicit sequence number.
    pub fn open(&self, sequence: i32, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() <= SIGNATURE_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "klap payload of {} bytes has no ciphertext",
                payload.len()
            )));
        }
        aes_cbc_decrypt(&self.key, &self.iv_for(sequence), &payload[SIGNATURE_LENGTH..])
    }

    /// Checks the signature prefix of a payload sealed under `sequence`.
    pub fn verify(&self, sequence: i32, payload: &[u8]) -> bool {
        payload.len() > SIGNATURE_LENGTH
            && self.signature(sequence, &payload[SIGNATURE_LENGTH..])[..]
                == payload[..SIGNATURE_LENGTH]
    }
}

impl std::fmt::Debug for KlapCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlapCipher")
            .field("sequence", &self.sequence)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
