//! Encrypted transport selected by the configured method.
//!
//! One enum rather than a trait object: the server's drain-and-hold needs
//! the raw TCP halves back, and the pool needs a liveness probe, neither of
//! which fits a plain read/write object.

use std::sync::Arc;

use async_trait::async_trait;

use super::aead::{AeadReadHalf, AeadTransport, AeadWriteHalf};
use super::plain::{PlainReadHalf, PlainTransport, PlainWriteHalf};
use super::{ReadTransport, WriteTransport};
use crate::common::{Buffer, Result};
use crate::crypto::replay::ReplayFilter;
use crate::crypto::{CipherFactory, Method};

#[cfg(feature = "stream-ciphers")]
use crate::crypto::stream::{StreamReadHalf, StreamTransport, StreamWriteHalf};

pub enum SecureTransport {
    Aead(AeadTransport),
    #[cfg(feature = "stream-ciphers")]
    Stream(StreamTransport),
}

pub enum SecureReadHalf {
    Aead(AeadReadHalf),
    #[cfg(feature = "stream-ciphers")]
    Stream(StreamReadHalf),
}

pub enum SecureWriteHalf {
    Aead(AeadWriteHalf),
    #[cfg(feature = "stream-ciphers")]
    Stream(StreamWriteHalf),
}

impl CipherFactory {
    /// Wraps a raw TCP transport in the encryption this factory was
    /// configured with.
    pub fn wrap(&self, plain: PlainTransport, replay: Arc<dyn ReplayFilter>) -> SecureTransport {
        match self.method() {
            Method::Aead(kind) => {
                SecureTransport::Aead(AeadTransport::new(plain, kind, self.key(), replay))
            }
            #[cfg(feature = "stream-ciphers")]
            Method::Stream(kind) => {
                SecureTransport::Stream(StreamTransport::new(plain, kind, self.key(), replay))
            }
        }
    }
}

impl SecureTransport {
    pub fn split(self) -> (SecureReadHalf, SecureWriteHalf) {
        match self {
            SecureTransport::Aead(t) => {
                let (r, w) = t.split();
                (SecureReadHalf::Aead(r), SecureWriteHalf::Aead(w))
            }
            #[cfg(feature = "stream-ciphers")]
            SecureTransport::Stream(t) => {
                let (r, w) = t.split();
                (SecureReadHalf::Stream(r), SecureWriteHalf::Stream(w))
            }
        }
    }

    pub fn halves_mut(&mut self) -> (&mut dyn ReadTransport, &mut dyn WriteTransport) {
        match self {
            SecureTransport::Aead(t) => {
                let (r, w) = t.halves_mut();
                (r, w)
            }
            #[cfg(feature = "stream-ciphers")]
            SecureTransport::Stream(t) => {
                let (r, w) = t.halves_mut();
                (r, w)
            }
        }
    }

    pub async fn alive(&mut self) -> bool {
        match self {
            SecureTransport::Aead(t) => t.alive().await,
            #[cfg(feature = "stream-ciphers")]
            SecureTransport::Stream(t) => t.alive().await,
        }
    }

    pub fn into_plain_halves(self) -> (PlainReadHalf, PlainWriteHalf) {
        match self {
            SecureTransport::Aead(t) => t.into_plain_halves(),
            #[cfg(feature = "stream-ciphers")]
            SecureTransport::Stream(t) => t.into_plain_halves(),
        }
    }
}

impl SecureReadHalf {
    pub async fn alive(&mut self) -> bool {
        match self {
            SecureReadHalf::Aead(r) => r.alive().await,
            #[cfg(feature = "stream-ciphers")]
            SecureReadHalf::Stream(r) => r.alive().await,
        }
    }
}

#[async_trait]
impl ReadTransport for SecureTransport {
    async fn read(&mut self, buf: &mut Buffer) -> Result<usize> {
        match self {
            SecureTransport::Aead(t) => t.read(buf).await,
            #[cfg(feature = "stream-ciphers")]
            SecureTransport::Stream(t) => t.read(buf).await,
        }
    }
}

#[async_trait]
impl WriteTransport for SecureTransport {
    async fn write(&mut self, buf: &mut Buffer) -> Result<()> {
        match self {
            SecureTransport::Aead(t) => t.write(buf).await,
            #[cfg(feature = "stream-ciphers")]
            SecureTransport::Stream(t) => t.write(buf).await,
        }
    }
}

#[async_trait]
impl ReadTransport for SecureReadHalf {
    async fn read(&mut self, buf: &mut Buffer) -> Result<usize> {
        match self {
            SecureReadHalf::Aead(r) => r.read(buf).await,
            #[cfg(feature = "stream-ciphers")]
            SecureReadHalf::Stream(r) => r.read(buf).await,
        }
    }
}

#[async_trait]
impl WriteTransport for SecureWriteHalf {
    async fn write(&mut self, buf: &mut Buffer) -> Result<()> {
        match self {
            SecureWriteHalf::Aead(w) => w.write(buf).await,
            #[cfg(feature = "stream-ciphers")]
            SecureWriteHalf::Stream(w) => w.write(buf).await,
        }
    }
}
