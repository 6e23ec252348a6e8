pub mod buffer;
pub mod error;
pub mod fd_gate;

pub use self::buffer::{Buffer, DEFAULT_BUF_SIZE, MAX_BUF_SIZE};
pub use self::error::{Error, Result};
pub use self::fd_gate::FdGate;
