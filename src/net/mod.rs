pub mod aead;
pub mod delay_init;
pub mod pipe;
pub mod plain;
pub mod secure;

use async_trait::async_trait;

use crate::common::{Buffer, Result};

/// Reading side of a transport. `read` appends whatever is available into
/// the buffer's spare capacity; `Ok(0)` signals a clean end of stream, a
/// connection that dies mid-frame surfaces as an error.
#[async_trait]
pub trait ReadTransport: Send {
    async fn read(&mut self, buf: &mut Buffer) -> Result<usize>;
}

/// Writing side of a transport. `write` sends the entire buffer content
/// (retrying partial writes) and leaves the buffer empty on success.
#[async_trait]
pub trait WriteTransport: Send {
    async fn write(&mut self, buf: &mut Buffer) -> Result<()>;
}

pub use self::pipe::{bidirectional_pipe, pipe};
pub use self::plain::{
    dial, dial_destination, PlainReadHalf, PlainTransport, PlainWriteHalf, MAX_READ_SIZE,
};
pub use self::secure::{SecureReadHalf, SecureTransport, SecureWriteHalf};
