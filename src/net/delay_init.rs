use async_trait::async_trait;

use super::WriteTransport;
use crate::common::{Buffer, Result};

/// Write wrapper that holds back a prefix until the first real write.
///
/// The connection pool dials the Shadowsocks server before it knows what
/// the first request body will be; the encoded target address is parked
/// here and rides in front of the first outgoing buffer, coalescing into
/// one encrypted chunk.
pub struct DelayInitWriter<W> {
    inner: W,
    prefix: Option<Vec<u8>>,
}

impl<W> DelayInitWriter<W> {
    pub fn new(inner: W, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix: Some(prefix),
        }
    }
}

#[async_trait]
impl<W: WriteTransport> WriteTransport for DelayInitWriter<W> {
    async fn write(&mut self, buf: &mut Buffer) -> Result<()> {
        if let Some(prefix) = self.prefix.take() {
            buf.prepend(&prefix)?;
        }
        self.inner.write(buf).await
    }
}
