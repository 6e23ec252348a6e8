//! Legacy IV-prefixed stream ciphers (`aes-*-cfb`, `aes-*-ctr`).
//!
//! These carry no authentication and no per-chunk framing: an IV in the
//! clear, then one continuous keystream. They exist for interoperability
//! with old deployments and stay behind the `stream-ciphers` feature.

use std::sync::Arc;

use aes::{Aes128, Aes192, Aes256};
use async_trait::async_trait;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use ctr::cipher::StreamCipher;

use crate::common::{Buffer, Error, Result};
use crate::crypto::replay::ReplayFilter;
use crate::crypto::random_salt;
use crate::net::plain::{PlainReadHalf, PlainTransport, PlainWriteHalf};
use crate::net::{ReadTransport, WriteTransport};

type Ctr128<C> = ctr::Ctr128BE<C>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
}

impl StreamKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aes-128-cfb" => Some(StreamKind::Aes128Cfb),
            "aes-192-cfb" => Some(StreamKind::Aes192Cfb),
            "aes-256-cfb" => Some(StreamKind::Aes256Cfb),
            "aes-128-ctr" => Some(StreamKind::Aes128Ctr),
            "aes-192-ctr" => Some(StreamKind::Aes192Ctr),
            "aes-256-ctr" => Some(StreamKind::Aes256Ctr),
            _ => None,
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            StreamKind::Aes128Cfb | StreamKind::Aes128Ctr => 16,
            StreamKind::Aes192Cfb | StreamKind::Aes192Ctr => 24,
            StreamKind::Aes256Cfb | StreamKind::Aes256Ctr => 32,
        }
    }

    pub fn iv_len(&self) -> usize {
        16
    }

    pub fn supported() -> Vec<&'static str> {
        vec![
            "aes-128-cfb",
            "aes-192-cfb",
            "aes-256-cfb",
            "aes-128-ctr",
            "aes-192-ctr",
            "aes-256-ctr",
        ]
    }
}

enum Cryptor {
    Cfb128Enc(BufEncryptor<Aes128>),
    Cfb192Enc(BufEncryptor<Aes192>),
    Cfb256Enc(BufEncryptor<Aes256>),
    Cfb128Dec(BufDecryptor<Aes128>),
    Cfb192Dec(BufDecryptor<Aes192>),
    Cfb256Dec(BufDecryptor<Aes256>),
    Ctr128(Ctr128<Aes128>),
    Ctr192(Ctr128<Aes192>),
    Ctr256(Ctr128<Aes256>),
}

impl Cryptor {
    fn encryptor(kind: StreamKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        let bad = |_| Error::InvalidKey("bad key/iv length".to_string());
        Ok(match kind {
            StreamKind::Aes128Cfb => {
                Cryptor::Cfb128Enc(BufEncryptor::new_from_slices(key, iv).map_err(bad)?)
            }
            StreamKind::Aes192Cfb => {
                Cryptor::Cfb192Enc(BufEncryptor::new_from_slices(key, iv).map_err(bad)?)
            }
            StreamKind::Aes256Cfb => {
                Cryptor::Cfb256Enc(BufEncryptor::new_from_slices(key, iv).map_err(bad)?)
            }
            StreamKind::Aes128Ctr => {
                Cryptor::Ctr128(Ctr128::new_from_slices(key, iv).map_err(bad)?)
            }
            StreamKind::Aes192Ctr => {
                Cryptor::Ctr192(Ctr128::new_from_slices(key, iv).map_err(bad)?)
            }
            StreamKind::Aes256Ctr => {
                Cryptor::Ctr256(Ctr128::new_from_slices(key, iv).map_err(bad)?)
            }
        })
    }

    fn decryptor(kind: StreamKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        let bad = |_| Error::InvalidKey("bad key/iv length".to_string());
        Ok(match kind {
            StreamKind::Aes128Cfb => {
                Cryptor::Cfb128Dec(BufDecryptor::new_from_slices(key, iv).map_err(bad)?)
            }
            StreamKind::Aes192Cfb => {
                Cryptor::Cfb192Dec(BufDecryptor::new_from_slices(key, iv).map_err(bad)?)
            }
            StreamKind::Aes256Cfb => {
                Cryptor::Cfb256Dec(BufDecryptor::new_from_slices(key, iv).map_err(bad)?)
            }
            // CTR is its own inverse
            _ => Self::encryptor(kind, key, iv)?,
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Cryptor::Cfb128Enc(c) => c.encrypt(data),
            Cryptor::Cfb192Enc(c) => c.encrypt(data),
            Cryptor::Cfb256Enc(c) => c.encrypt(data),
            Cryptor::Cfb128Dec(c) => c.decrypt(data),
            Cryptor::Cfb192Dec(c) => c.decrypt(data),
            Cryptor::Cfb256Dec(c) => c.decrypt(data),
            Cryptor::Ctr128(c) => c.apply_keystream(data),
            Cryptor::Ctr192(c) => c.apply_keystream(data),
            Cryptor::Ctr256(c) => c.apply_keystream(data),
        }
    }
}

pub struct StreamTransport {
    reader: StreamReadHalf,
    writer: StreamWriteHalf,
}

pub struct StreamReadHalf {
    plain: PlainReadHalf,
    kind: StreamKind,
    key: Arc<Vec<u8>>,
    replay: Arc<dyn ReplayFilter>,
    cipher: Option<Cryptor>,
}

pub struct StreamWriteHalf {
    plain: PlainWriteHalf,
    kind: StreamKind,
    key: Arc<Vec<u8>>,
    cipher: Option<Cryptor>,
}

impl StreamTransport {
    pub fn new(
        plain: PlainTransport,
        kind: StreamKind,
        key: Arc<Vec<u8>>,
        replay: Arc<dyn ReplayFilter>,
    ) -> Self {
        let (read, write) = plain.split();
        Self {
            reader: StreamReadHalf {
                plain: read,
                kind,
                key: key.clone(),
                replay,
                cipher: None,
            },
            writer: StreamWriteHalf {
                plain: write,
                kind,
                key,
                cipher: None,
            },
        }
    }

    pub fn split(self) -> (StreamReadHalf, StreamWriteHalf) {
        (self.reader, self.writer)
    }

    pub fn halves_mut(&mut self) -> (&mut StreamReadHalf, &mut StreamWriteHalf) {
        (&mut self.reader, &mut self.writer)
    }

    pub async fn alive(&mut self) -> bool {
        self.reader.alive().await
    }

    pub fn into_plain_halves(self) -> (PlainReadHalf, PlainWriteHalf) {
        (self.reader.plain, self.writer.plain)
    }
}

impl StreamReadHalf {
    pub async fn alive(&mut self) -> bool {
        self.plain.alive().await
    }
}

#[async_trait]
impl ReadTransport for StreamReadHalf {
    async fn read(&mut self, buf: &mut Buffer) -> Result<usize> {
        if self.cipher.is_none() {
            let mut iv = vec![0u8; self.kind.iv_len()];
            if !self.plain.read_frame(&mut iv).await? {
                return Ok(0);
            }
            // no authentication here, so the IV is recorded right away
            if self.replay.contains(&iv) {
                return Err(Error::DuplicateSalt);
            }
            self.replay.add(&iv);
            self.cipher = Some(Cryptor::decryptor(self.kind, &self.key, &iv)?);
        }

        let start = buf.len();
        let n = self.plain.read(buf).await?;
        if n == 0 {
            return Ok(0);
        }
        let cipher = match self.cipher.as_mut() {
            Some(c) => c,
            None => unreachable!("cipher initialised above"),
        };
        cipher.apply(&mut buf.as_mut_slice()[start..]);
        Ok(n)
    }
}

#[async_trait]
impl WriteTransport for StreamWriteHalf {
    async fn write(&mut self, buf: &mut Buffer) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut fresh_iv: Option<Vec<u8>> = None;
        if self.cipher.is_none() {
            let iv = random_salt(self.kind.iv_len());
            self.cipher = Some(Cryptor::encryptor(self.kind, &self.key, &iv)?);
            fresh_iv = Some(iv);
        }
        let cipher = match self.cipher.as_mut() {
            Some(c) => c,
            None => unreachable!("cipher initialised above"),
        };
        cipher.apply(buf.as_mut_slice());
        if let Some(iv) = fresh_iv {
            buf.prepend(&iv)?;
        }
        self.plain.write(buf).await
    }
}

#[async_trait]
impl ReadTransport for StreamTransport {
    async fn read(&mut self, buf: &mut Buffer) -> Result<usize> {
        self.reader.read(buf).await
    }
}

#[async_trait]
impl WriteTransport for StreamTransport {
    async fn write(&mut self, buf: &mut Buffer) -> Result<()> {
        self.writer.write(buf).await
    }
}
