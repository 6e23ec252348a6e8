//! AEAD-framed secure stream.
//!
//! Wire format: a cleartext salt, then a stream of chunks, each
//! `Seal(len, nonce) || Seal(payload, nonce+1)` with `len` big-endian and
//! capped at 0x3FFF. Each direction carries its own salt, subkey and nonce
//! counter, initialised lazily on first use so a connection that only ever
//! talks one way never emits the other salt.

use std::sync::Arc;

use async_trait::async_trait;

use super::plain::{PlainReadHalf, PlainTransport, PlainWriteHalf};
use super::{ReadTransport, WriteTransport};
use crate::common::{Buffer, Error, Result};
use crate::crypto::replay::ReplayFilter;
use crate::crypto::{derive_subkey, random_salt, AeadCipher, CipherKind};

/// Maximum payload size per AEAD chunk (0x3FFF = 16383)
pub const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

const LEN_SIZE: usize = 2;

pub struct AeadTransport {
    reader: AeadReadHalf,
    writer: AeadWriteHalf,
}

pub struct AeadReadHalf {
    plain: PlainReadHalf,
    kind: CipherKind,
    key: Arc<Vec<u8>>,
    replay: Arc<dyn ReplayFilter>,
    cipher: Option<AeadCipher>,
}

pub struct AeadWriteHalf {
    plain: PlainWriteHalf,
    kind: CipherKind,
    key: Arc<Vec<u8>>,
    cipher: Option<AeadCipher>,
}

impl AeadTransport {
    pub fn new(
        plain: PlainTransport,
        kind: CipherKind,
        key: Arc<Vec<u8>>,
        replay: Arc<dyn ReplayFilter>,
    ) -> Self {
        let (read, write) = plain.split();
        Self {
            reader: AeadReadHalf {
                plain: read,
                kind,
                key: key.clone(),
                replay,
                cipher: None,
            },
            writer: AeadWriteHalf {
                plain: write,
                kind,
                key,
                cipher: None,
            },
        }
    }

    pub fn split(self) -> (AeadReadHalf, AeadWriteHalf) {
        (self.reader, self.writer)
    }

    pub fn halves_mut(&mut self) -> (&mut AeadReadHalf, &mut AeadWriteHalf) {
        (&mut self.reader, &mut self.writer)
    }

    pub async fn alive(&mut self) -> bool {
        self.reader.alive().await
    }

    /// Surrenders the raw TCP halves, discarding cipher state. The server's
    /// drain-and-hold path uses this to keep reading a failed connection
    /// without ever answering it.
    pub fn into_plain_halves(self) -> (PlainReadHalf, PlainWriteHalf) {
        (self.reader.plain, self.writer.plain)
    }
}

impl AeadReadHalf {
    pub async fn alive(&mut self) -> bool {
        self.plain.alive().await
    }

    async fn read_chunks(&mut self, buf: &mut Buffer) -> Result<usize> {
        let mut fresh_salt: Option<Vec<u8>> = None;
        if self.cipher.is_none() {
            let mut salt = vec![0u8; self.kind.salt_len()];
            if !self.plain.read_frame(&mut salt).await? {
                return Ok(0);
            }
            if self.replay.contains(&salt) {
                return Err(Error::DuplicateSalt);
            }
            let subkey = derive_subkey(&self.key, &salt, self.kind.key_len())?;
            self.cipher = Some(AeadCipher::new(self.kind, subkey));
            fresh_salt = Some(salt);
        }

        let tag_len = self.kind.tag_len();
        loop {
            let mut len_frame = vec![0u8; LEN_SIZE + tag_len];
            if !self.plain.read_frame(&mut len_frame).await? {
                return Ok(0);
            }
            let cipher = match self.cipher.as_mut() {
                Some(c) => c,
                None => unreachable!("cipher initialised above"),
            };
            let len_plain = cipher.decrypt(&len_frame)?;
            let n = u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize;
            if n & MAX_PAYLOAD_SIZE != n {
                return Err(Error::InvalidChunkSize);
            }

            let mut payload_frame = vec![0u8; n + tag_len];
            if !self.plain.read_frame(&mut payload_frame).await? {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before payload chunk",
                )));
            }
            let payload = cipher.decrypt(&payload_frame)?;
            buf.append(&payload)?;

            // The salt only counts once the first chunk has authenticated,
            // so garbage thrown at the port cannot poison the filter.
            if let Some(salt) = fresh_salt.take() {
                self.replay.add(&salt);
            }

            if n > 0 {
                return Ok(n);
            }
            // zero-length chunk: keep going, Ok(0) is reserved for EOF
        }
    }
}

impl AeadWriteHalf {
    async fn write_chunks(&mut self, buf: &mut Buffer) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let mut out: Vec<u8> = Vec::with_capacity(
            self.kind.salt_len() + buf.len() + (LEN_SIZE + 2 * self.kind.tag_len()) * 2,
        );
        if self.cipher.is_none() {
            let salt = random_salt(self.kind.salt_len());
            let subkey = derive_subkey(&self.key, &salt, self.kind.key_len())?;
            out.extend_from_slice(&salt);
            self.cipher = Some(AeadCipher::new(self.kind, subkey));
        }
        let cipher = match self.cipher.as_mut() {
            Some(c) => c,
            None => unreachable!("cipher initialised above"),
        };

        for chunk in buf.as_slice().chunks(MAX_PAYLOAD_SIZE) {
            let len_bytes = (chunk.len() as u16).to_be_bytes();
            out.extend_from_slice(&cipher.encrypt(&len_bytes)?);
            out.extend_from_slice(&cipher.encrypt(chunk)?);
        }

        // One write: a fresh direction's salt rides with its first chunk.
        self.plain.write_bytes(&out).await?;
        buf.clear();
        Ok(())
    }
}

#[async_trait]
impl ReadTransport for AeadReadHalf {
    async fn read(&mut self, buf: &mut Buffer) -> Result<usize> {
        self.read_chunks(buf).await
    }
}

#[async_trait]
impl WriteTransport for AeadWriteHalf {
    async fn write(&mut self, buf: &mut Buffer) -> Result<()> {
        self.write_chunks(buf).await
    }
}

#[async_trait]
impl ReadTransport for AeadTransport {
    async fn read(&mut self, buf: &mut Buffer) -> Result<usize> {
        self.reader.read_chunks(buf).await
    }
}

#[async_trait]
impl WriteTransport for AeadTransport {
    async fn write(&mut self, buf: &mut Buffer) -> Result<()> {
        self.writer.write_chunks(buf).await
    }
}
