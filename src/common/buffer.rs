use tracing::warn;

use super::error::{Error, Result};

/// Initial capacity of a connection buffer.
pub const DEFAULT_BUF_SIZE: usize = 16 * 1024;
/// Hard cap on a connection buffer. A buffer never grows past this.
pub const MAX_BUF_SIZE: usize = 64 * 1024;

/// Growable byte buffer reused across read/transform/write cycles.
///
/// One buffer serves one direction of one connection. Transports append on
/// read and drain the whole content on write, so a well-tuned setup never
/// allocates after the handshake.
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUF_SIZE)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap.min(MAX_BUF_SIZE)),
        }
    }

    pub fn from_slice(content: &[u8]) -> Self {
        let mut buf = Self::with_capacity(content.len().max(DEFAULT_BUF_SIZE));
        buf.data.extend_from_slice(content);
        buf
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Grows capacity to at least `target`: doubled, clamped to
    /// [`MAX_BUF_SIZE`]. Fails once the cap is reached. Expansion is legal
    /// but expected to be rare, hence the log line.
    pub fn expand(&mut self, target: usize) -> Result<()> {
        let cap = self.data.capacity();
        if cap >= MAX_BUF_SIZE {
            return Err(Error::BufferSizeExceeded);
        }
        warn!(
            capacity = cap,
            target, "buffer expansion, consider retuning buffer sizes"
        );
        let new_cap = (cap * 2).max(target).min(MAX_BUF_SIZE);
        self.data.reserve_exact(new_cap - self.data.len());
        Ok(())
    }

    /// Makes sure at least `extra` bytes of spare capacity exist.
    pub fn reserve_extra(&mut self, extra: usize) -> Result<()> {
        if self.data.capacity() - self.data.len() < extra {
            self.expand(self.data.len() + extra)?;
        }
        Ok(())
    }

    /// Appends `content`, expanding if needed.
    pub fn append(&mut self, content: &[u8]) -> Result<()> {
        self.reserve_extra(content.len())?;
        self.data.extend_from_slice(content);
        Ok(())
    }

    /// Exposes a zeroed window of spare capacity (at most `max_extra`
    /// bytes) for a transport read. The window becomes part of the length;
    /// callers must [`truncate`](Self::truncate) back down to what was
    /// actually filled.
    pub fn read_window(&mut self, max_extra: usize) -> (usize, &mut [u8]) {
        let start = self.data.len();
        let end = self.data.capacity().min(start + max_extra);
        self.data.resize(end, 0);
        (start, &mut self.data[start..])
    }

    /// Drops the first `n` bytes, shifting the remainder to the front.
    pub fn consume(&mut self, n: usize) {
        self.data.drain(..n);
    }

    /// Inserts `prefix` before the current content, expanding if needed.
    pub fn prepend(&mut self, prefix: &[u8]) -> Result<()> {
        self.reserve_extra(prefix.len())?;
        self.data.splice(..0, prefix.iter().copied());
        Ok(())
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
