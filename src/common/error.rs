use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// AEAD open failed. On the server this must not close the connection
    /// outright (see drain-and-hold in the server module).
    #[error("authentication failure")]
    AuthFailed,

    /// A salt was seen twice, most likely a replayed first chunk.
    #[error("duplicated salt (maybe replay attack)")]
    DuplicateSalt,

    #[error("invalid chunk size")]
    InvalidChunkSize,

    #[error("maximum buffer size exceeded")]
    BufferSizeExceeded,

    #[error("invalid address type")]
    InvalidAddressType,

    #[error("invalid address")]
    InvalidAddress,

    #[error("host too long")]
    HostTooLong,

    #[error("invalid {0} protocol")]
    InvalidProtocol(&'static str),

    #[error("unsupported {0} command")]
    CommandNotSupported(&'static str),

    #[error("socks5 request requires auth")]
    NoValidAuth,

    #[error("invalid HTTP header")]
    InvalidHttpHeader,

    #[error("HTTP connection manager is dead")]
    ManagerDead,

    #[error("server does not exist")]
    ServerDoesNotExist,

    #[error("unknown cipher: {0}")]
    UnknownCipher(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is an authentication error. Auth errors get
    /// special treatment on the server: the connection is drained instead
    /// of closed so a probe cannot measure the difference.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::AuthFailed | Error::DuplicateSalt)
    }
}
