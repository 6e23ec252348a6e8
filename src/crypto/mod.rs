pub mod replay;
#[cfg(feature = "stream-ciphers")]
pub mod stream;

use std::sync::Arc;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{AeadInPlace, Aes128Gcm, Aes256Gcm, KeyInit};
use base64::Engine;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest as Md5Digest, Md5};
use rand::Rng;
use sha1::Sha1;

use crate::common::{Error, Result};

type Aes192Gcm = aes_gcm::AesGcm<aes_gcm::aes::Aes192, aes_gcm::aead::consts::U12>;

const HKDF_INFO: &[u8] = b"ss-subkey";

/// Shadowsocks AEAD cipher kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    /// Key length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes192Gcm => 24,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// Salt length in bytes (same as key length)
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    /// AEAD tag length in bytes (always 16 for all supported ciphers)
    pub fn tag_len(&self) -> usize {
        16
    }
}

/// An encryption method selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aead(CipherKind),
    #[cfg(feature = "stream-ciphers")]
    Stream(stream::StreamKind),
}

impl Method {
    /// Parse cipher method name string
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" => Ok(Method::Aead(CipherKind::Aes128Gcm)),
            "aes-192-gcm" => Ok(Method::Aead(CipherKind::Aes192Gcm)),
            "aes-256-gcm" => Ok(Method::Aead(CipherKind::Aes256Gcm)),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => {
                Ok(Method::Aead(CipherKind::ChaCha20Poly1305))
            }
            other => {
                #[cfg(feature = "stream-ciphers")]
                if let Some(kind) = stream::StreamKind::parse(other) {
                    return Ok(Method::Stream(kind));
                }
                Err(Error::UnknownCipher(other.to_string()))
            }
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            Method::Aead(kind) => kind.key_len(),
            #[cfg(feature = "stream-ciphers")]
            Method::Stream(kind) => kind.key_len(),
        }
    }

    /// Method names accepted by [`parse`](Self::parse), for CLI help output.
    pub fn supported() -> Vec<&'static str> {
        let mut names = vec![
            "aes-128-gcm",
            "aes-192-gcm",
            "aes-256-gcm",
            "chacha20-ietf-poly1305",
        ];
        #[cfg(feature = "stream-ciphers")]
        names.extend(stream::StreamKind::supported());
        names
    }
}

/// Cipher factory bound to a method and master key; one per context,
/// shared by every connection the context accepts or dials.
#[derive(Clone)]
pub struct CipherFactory {
    method: Method,
    key: Arc<Vec<u8>>,
}

impl CipherFactory {
    /// Derives the master key and builds a factory. `key_b64` (a base64
    /// pre-derived key) wins over `password` when present.
    pub fn new(method_name: &str, password: &str, key_b64: Option<&str>) -> Result<Self> {
        let method = Method::parse(method_name)?;
        let key = match key_b64 {
            Some(encoded) if !encoded.is_empty() => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| Error::InvalidKey(e.to_string()))?;
                if decoded.len() < method.key_len() {
                    return Err(Error::InvalidKey(format!(
                        "need {} bytes, got {}",
                        method.key_len(),
                        decoded.len()
                    )));
                }
                let mut key = decoded;
                key.truncate(method.key_len());
                key
            }
            _ => evp_bytes_to_key(password.as_bytes(), method.key_len()),
        };
        Ok(Self {
            method,
            key: Arc::new(key),
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn key(&self) -> Arc<Vec<u8>> {
        self.key.clone()
    }
}

/// Derive key from password using EVP_BytesToKey (OpenSSL compatible).
///
/// Algorithm: iterative MD5 hashing.
/// D_0 = MD5(password)
/// D_i = MD5(D_{i-1} || password)
/// Concatenate until we have at least key_len bytes.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev_hash: Option<Vec<u8>> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(ref prev) = prev_hash {
            hasher.update(prev);
        }
        hasher.update(password);
        let hash = hasher.finalize().to_vec();
        key.extend_from_slice(&hash);
        prev_hash = Some(hash);
    }

    key.truncate(key_len);
    key
}

/// Derive a per-connection subkey: HKDF-SHA1 with info = b"ss-subkey".
pub fn derive_subkey(key: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(HKDF_INFO, &mut subkey)
        .map_err(|e| Error::InvalidKey(format!("HKDF expand failed: {}", e)))?;
    Ok(subkey)
}

pub fn random_salt(len: usize) -> Vec<u8> {
    let mut salt = vec![0u8; len];
    rand::thread_rng().fill(&mut salt[..]);
    salt
}

/// AEAD cipher with nonce counter for Shadowsocks stream encryption.
pub struct AeadCipher {
    cipher_kind: CipherKind,
    key: Vec<u8>,
    nonce: u64,
}

impl AeadCipher {
    /// Create a new AEAD cipher with the given subkey.
    pub fn new(cipher_kind: CipherKind, subkey: Vec<u8>) -> Self {
        Self {
            cipher_kind,
            key: subkey,
            nonce: 0,
        }
    }

    /// Get the current nonce as a 12-byte LE-encoded array, then increment.
    fn nonce_bytes_and_increment(&mut self) -> [u8; 12] {
        let nonce = self.nonce_bytes();
        self.nonce += 1;
        nonce
    }

    /// Get the current nonce as 12-byte LE-encoded array (without incrementing).
    pub fn nonce_bytes(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.nonce.to_le_bytes());
        nonce
    }

    /// Encrypt plaintext, returning ciphertext + tag.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce_bytes_and_increment();
        let mut buf = plaintext.to_vec();

        let tag = match self.cipher_kind {
            CipherKind::Aes128Gcm => {
                let cipher = Aes128Gcm::new(GenericArray::from_slice(&self.key));
                cipher.encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf)
            }
            CipherKind::Aes192Gcm => {
                let cipher = Aes192Gcm::new(GenericArray::from_slice(&self.key));
                cipher.encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf)
            }
            CipherKind::Aes256Gcm => {
                let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
                cipher.encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf)
            }
            CipherKind::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&self.key));
                cipher.encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf)
            }
        }
        .map_err(|_| Error::AuthFailed)?;

        buf.extend_from_slice(&tag);
        Ok(buf)
    }

    /// Decrypt ciphertext (with appended tag), returning plaintext.
    pub fn decrypt(&mut self, ciphertext_with_tag: &[u8]) -> Result<Vec<u8>> {
        let tag_len = self.cipher_kind.tag_len();
        if ciphertext_with_tag.len() < tag_len {
            return Err(Error::AuthFailed);
        }

        let nonce = self.nonce_bytes_and_increment();
        let ct_len = ciphertext_with_tag.len() - tag_len;
        let mut buf = ciphertext_with_tag[..ct_len].to_vec();
        let tag = &ciphertext_with_tag[ct_len..];

        match self.cipher_kind {
            CipherKind::Aes128Gcm => {
                let cipher = Aes128Gcm::new(GenericArray::from_slice(&self.key));
                cipher.decrypt_in_place_detached(
                    GenericArray::from_slice(&nonce),
                    b"",
                    &mut buf,
                    GenericArray::from_slice(tag),
                )
            }
            CipherKind::Aes192Gcm => {
                let cipher = Aes192Gcm::new(GenericArray::from_slice(&self.key));
                cipher.decrypt_in_place_detached(
                    GenericArray::from_slice(&nonce),
                    b"",
                    &mut buf,
                    GenericArray::from_slice(tag),
                )
            }
            CipherKind::Aes256Gcm => {
                let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
                cipher.decrypt_in_place_detached(
                    GenericArray::from_slice(&nonce),
                    b"",
                    &mut buf,
                    GenericArray::from_slice(tag),
                )
            }
            CipherKind::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&self.key));
                cipher.decrypt_in_place_detached(
                    GenericArray::from_slice(&nonce),
                    b"",
                    &mut buf,
                    GenericArray::from_slice(tag),
                )
            }
        }
        .map_err(|_| Error::AuthFailed)?;

        Ok(buf)
    }

    #[cfg(test)]
    pub(crate) fn nonce_counter(&self) -> u64 {
        self.nonce
    }
}
