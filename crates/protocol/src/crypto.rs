//! Cryptographic primitives shared by the passthrough, KLAP and discovery
//! protocols.
//!
//! This module provides RSA key pair generation and unwrapping, the SHA-1 /
//! SHA-256 / MD5 digests the device firmware expects, AES-128-CBC with PKCS#7
//! padding, and the [`PassthroughCipher`] negotiated by the secure passthrough
//! handshake.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::Md5;
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// RSA modulus size used by the passthrough handshake.
pub const HANDSHAKE_RSA_BITS: usize = 1024;

/// RSA modulus size used by UDP discovery.
pub const DISCOVERY_RSA_BITS: usize = 2048;

/// AES-128 key length in bytes.
pub const AES_KEY_LENGTH: usize = 16;

/// AES block and IV length in bytes.
pub const AES_BLOCK_LENGTH: usize = 16;

/// Length of the symmetric session key blob: key followed by IV.
pub const SESSION_KEY_LENGTH: usize = AES_KEY_LENGTH + AES_BLOCK_LENGTH;

/// Computes the SHA-1 digest of `data`.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Computes the SHA-256 digest of the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Computes the MD5 digest of `data`.
pub fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// Lowercase hex SHA-1 of a UTF-8 string, base64 encoded.
///
/// The login endpoint expects digests in this double-encoded form rather than
/// as raw digest bytes.
pub fn sha1_hex_base64(value: &str) -> String {
    let hex_digest: String = sha1(value.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    BASE64.encode(hex_digest)
}

/// Encrypts `plaintext` with AES-128-CBC and PKCS#7 padding.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let encryptor = Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|e| ProtocolError::InvalidKey(format!("aes key/iv: {}", e)))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypts AES-128-CBC `ciphertext` and strips PKCS#7 padding.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_LENGTH != 0 {
        return Err(ProtocolError::Decryption(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            AES_BLOCK_LENGTH
        )));
    }
    let decryptor = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| ProtocolError::InvalidKey(format!("aes key/iv: {}", e)))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ProtocolError::Decryption("invalid pkcs7 padding".to_string()))
}

/// An ephemeral RSA key pair.
///
/// The public half is exported once per handshake; the private half unwraps
/// the device's symmetric key blob and is then dropped with the pair.
pub struct KeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl KeyPair {
    /// Generates a fresh key pair with a modulus of `bits` bits.
    pub fn generate(bits: usize) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| ProtocolError::KeyGeneration(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Base64 of the DER SubjectPublicKeyInfo, on a single line.
    pub fn public_key_base64(&self) -> Result<String> {
        let der = self
            .public_key
            .to_public_key_der()
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        Ok(BASE64.encode(der.as_bytes()))
    }

    /// The public key wrapped in PEM markers without line folding.
    ///
    /// This is the layout the passthrough `handshake` method accepts.
    pub fn handshake_pem(&self) -> Result<String> {
        Ok(format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            self.public_key_base64()?
        ))
    }

    /// The public key as a standard 64-column PEM document.
    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))
    }

    /// Decrypts an RSA PKCS#1 v1.5 ciphertext.
    pub fn decrypt_pkcs1v15(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.private_key.decrypt(Pkcs1v15Encrypt, ciphertext)?)
    }

    /// Decrypts an RSA-OAEP ciphertext using SHA-1 for both digest and MGF1.
    pub fn decrypt_oaep_sha1(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.private_key.decrypt(Oaep::new::<Sha1>(), ciphertext)?)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// AES-128-CBC cipher negotiated by the passthrough handshake.
///
/// Every message is encrypted under the same key and IV for the lifetime of
/// the session; ciphertext travels base64 encoded inside JSON.
#[derive(Clone, PartialEq, Eq)]
pub struct PassthroughCipher {
    key: [u8; AES_KEY_LENGTH],
    iv: [u8; AES_BLOCK_LENGTH],
}

impl PassthroughCipher {
    /// Creates a cipher from an explicit key and IV.
    pub fn new(key: [u8; AES_KEY_LENGTH], iv: [u8; AES_BLOCK_LENGTH]) -> Self {
        Self { key, iv }
    }

    /// Splits a 32-byte session key blob into key and IV.
    ///
    /// Blobs of any other length are rejected.
    pub fn from_session_key(blob: &[u8]) -> Result<Self> {
        if blob.len() != SESSION_KEY_LENGTH {
            return Err(ProtocolError::InvalidKey(format!(
                "session key blob is {} bytes, expected {}",
                blob.len(),
                SESSION_KEY_LENGTH
            )));
        }
        let mut key = [0u8; AES_KEY_LENGTH];
        let mut iv = [0u8; AES_BLOCK_LENGTH];
        key.copy_from_slice(&blob[..AES_KEY_LENGTH]);
        iv.copy_from_slice(&blob[AES_KEY_LENGTH..]);
        Ok(Self { key, iv })
    }

    /// Unwraps the base64 RSA PKCS#1 v1.5 key blob from a handshake reply.
    pub fn from_handshake_key(encoded_key: &str, key_pair: &KeyPair) -> Result<Self> {
        let wrapped = BASE64.decode(encoded_key.trim())?;
        let blob = key_pair.decrypt_pkcs1v15(&wrapped)?;
        Self::from_session_key(&blob)
    }

    /// Encrypts a plaintext string and returns base64 ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let ciphertext = aes_cbc_encrypt(&self.key, &self.iv, plaintext.as_bytes())?;
        Ok(BASE64.encode(ciphertext))
    }

    /// Decrypts base64 ciphertext back into a UTF-8 string.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let ciphertext = BASE64.decode(encoded.trim())?;
        let plaintext = aes_cbc_decrypt(&self.key, &self.iv, &ciphertext)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

impl std::fmt::Debug for PassthroughCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassthroughCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Generates the opaque terminal identifier attached to passthrough requests.
///
/// base64 of the MD5 digest of a random UUIDv4.
pub fn generate_terminal_uuid() -> String {
    let id = uuid::Uuid::new_v4();
    BASE64.encode(md5(id.as_bytes()))
}
