use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use socket2::TcpKeepalive;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};

use super::{ReadTransport, WriteTransport};
use crate::common::{Buffer, Error, Result};

/// Upper bound on a single transport read. Keeps one connection from
/// monopolising a buffer that is also carrying protocol rewrites.
pub const MAX_READ_SIZE: usize = 4 * 1024;

/// Raw TCP transport. Owns both halves of the stream so that a handler can
/// interleave reads and writes during a handshake and then `split` for
/// concurrent piping.
pub struct PlainTransport {
    reader: PlainReadHalf,
    writer: PlainWriteHalf,
}

pub struct PlainReadHalf {
    half: OwnedReadHalf,
}

pub struct PlainWriteHalf {
    half: OwnedWriteHalf,
}

impl PlainTransport {
    /// Wraps an accepted connection: TCP_NODELAY plus SO_KEEPALIVE with
    /// the configured period.
    pub fn accepted(stream: TcpStream, keepalive: Duration) -> Result<Self> {
        stream.set_nodelay(true)?;
        let sock = socket2::SockRef::from(&stream);
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(keepalive))?;
        sock.set_keepalive(true)?;
        Ok(Self::from_stream(stream))
    }

    /// Wraps an outbound connection: TCP_NODELAY only.
    pub fn connected(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: PlainReadHalf { half: read },
            writer: PlainWriteHalf { half: write },
        }
    }

    pub fn split(self) -> (PlainReadHalf, PlainWriteHalf) {
        (self.reader, self.writer)
    }

    pub fn halves_mut(&mut self) -> (&mut PlainReadHalf, &mut PlainWriteHalf) {
        (&mut self.reader, &mut self.writer)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.reader.half.peer_addr()?)
    }

    /// As [`ReadTransport::read`], but gives up after `millis` and reports
    /// zero bytes instead of an error. Used for the post-handshake
    /// opportunistic peek that folds an eager client's first payload bytes
    /// into the same encrypted chunk as the address.
    pub async fn read_with_timeout(&mut self, buf: &mut Buffer, millis: u64) -> Result<usize> {
        self.reader.read_timeout(buf, millis).await
    }

    /// Zero-deadline liveness probe.
    pub async fn alive(&mut self) -> bool {
        self.reader.alive().await
    }
}

impl PlainReadHalf {
    pub(crate) async fn read(&mut self, buf: &mut Buffer) -> Result<usize> {
        if buf.len() == buf.capacity() {
            buf.expand(buf.len() + 1)?;
        }
        let (start, window) = buf.read_window(MAX_READ_SIZE);
        match self.half.read(window).await {
            Ok(n) => {
                buf.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                buf.truncate(start);
                Err(e.into())
            }
        }
    }

    /// Timed variant of [`read`](Self::read): a deadline is not an error,
    /// just zero bytes. The deadline only covers the socket read itself, so
    /// an expiry cannot leave half-written window bytes in the buffer.
    pub(crate) async fn read_timeout(&mut self, buf: &mut Buffer, millis: u64) -> Result<usize> {
        if buf.len() == buf.capacity() {
            buf.expand(buf.len() + 1)?;
        }
        let (start, window) = buf.read_window(MAX_READ_SIZE);
        match tokio::time::timeout(Duration::from_millis(millis), self.half.read(window)).await {
            Ok(Ok(n)) => {
                buf.truncate(start + n);
                Ok(n)
            }
            Ok(Err(e)) => {
                buf.truncate(start);
                Err(e.into())
            }
            Err(_) => {
                buf.truncate(start);
                Ok(0)
            }
        }
    }

    /// Fills `out` exactly. `Ok(false)` when the peer closed cleanly before
    /// the first byte; an `UnexpectedEof` error when it closed mid-frame.
    pub(crate) async fn read_frame(&mut self, out: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < out.len() {
            let n = self.half.read(&mut out[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                )));
            }
            filled += n;
        }
        Ok(true)
    }

    /// Peek with a zero deadline: end-of-stream means dead, anything else
    /// (data or simply nothing ready yet) means alive.
    pub(crate) async fn alive(&mut self) -> bool {
        let mut probe = [0u8; 1];
        match tokio::time::timeout(Duration::ZERO, self.half.peek(&mut probe)).await {
            Ok(Ok(0)) => false,
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
            Err(_) => true,
        }
    }
}

impl PlainWriteHalf {
    pub(crate) async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.half.write_all(bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ReadTransport for PlainTransport {
    async fn read(&mut self, buf: &mut Buffer) -> Result<usize> {
        self.reader.read(buf).await
    }
}

#[async_trait]
impl WriteTransport for PlainTransport {
    async fn write(&mut self, buf: &mut Buffer) -> Result<()> {
        self.writer.write(buf).await
    }
}

#[async_trait]
impl ReadTransport for PlainReadHalf {
    async fn read(&mut self, buf: &mut Buffer) -> Result<usize> {
        PlainReadHalf::read(self, buf).await
    }
}

#[async_trait]
impl WriteTransport for PlainWriteHalf {
    async fn write(&mut self, buf: &mut Buffer) -> Result<()> {
        self.half.write_all(buf.as_slice()).await?;
        buf.clear();
        Ok(())
    }
}

/// Connects to a `host:port` / `[v6]:port` string.
pub async fn dial(addr: &str) -> Result<TcpStream> {
    let (host, port) = crate::addr::split_authority(addr, 0)?;
    let mut last_err: Option<std::io::Error> = None;
    for resolved in lookup_host((host.as_str(), port)).await? {
        match TcpStream::connect(resolved).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .map(Error::Io)
        .unwrap_or(Error::InvalidAddress))
}

/// Server-side destination dial: optional IPv4-only filter plus an overall
/// connect deadline.
pub async fn dial_destination(
    host: &str,
    port: u16,
    v4_only: bool,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let attempt = async {
        let mut last_err: Option<std::io::Error> = None;
        for resolved in lookup_host((host, port)).await? {
            if v4_only && !resolved.is_ipv4() {
                continue;
            }
            match TcpStream::connect(resolved).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => Error::Io(e),
            None => Error::InvalidAddress,
        })
    };
    match tokio::time::timeout(connect_timeout, attempt).await {
        Ok(res) => res,
        Err(_) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpStream::connect(addr).await.unwrap();
        (client, accept.await.unwrap())
    }

    #[tokio::test]
    async fn read_appends_and_write_drains() {
        let (client, server) = tcp_pair().await;
        let mut client = PlainTransport::connected(client).unwrap();
        let mut server = PlainTransport::connected(server).unwrap();

        let mut out = Buffer::from_slice(b"ping");
        client.write(&mut out).await.unwrap();
        assert!(out.is_empty());

        let mut buf = Buffer::new();
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.as_slice(), b"ping");

        // a second read appends rather than overwrites
        let mut out = Buffer::from_slice(b"pong");
        client.write(&mut out).await.unwrap();
        server.read(&mut buf).await.unwrap();
        assert_eq!(buf.as_slice(), b"pingpong");
    }

    #[tokio::test]
    async fn read_reports_clean_eof() {
        let (client, server) = tcp_pair().await;
        drop(client);
        let mut server = PlainTransport::connected(server).unwrap();
        let mut buf = Buffer::new();
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn timed_read_returns_zero_without_data() {
        let (client, server) = tcp_pair().await;
        let _keep = client;
        let mut server = PlainTransport::connected(server).unwrap();
        let mut buf = Buffer::new();
        let n = server.read_with_timeout(&mut buf, 5).await.unwrap();
        assert_eq!(n, 0);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn alive_tracks_peer_close() {
        let (client, server) = tcp_pair().await;
        let mut server = PlainTransport::connected(server).unwrap();
        assert!(server.alive().await);
        drop(client);
        // give the FIN a moment to arrive
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!server.alive().await);
    }

    #[tokio::test]
    async fn read_frame_distinguishes_eof_kinds() {
        let (client, server) = tcp_pair().await;
        let mut client = PlainTransport::connected(client).unwrap();
        let (mut reader, _writer) = PlainTransport::connected(server).unwrap().split();

        let mut out = Buffer::from_slice(b"abc");
        client.write(&mut out).await.unwrap();
        drop(client);

        let mut frame = [0u8; 3];
        assert!(reader.read_frame(&mut frame).await.unwrap());
        assert_eq!(&frame, b"abc");

        // clean EOF at a frame boundary
        assert!(!reader.read_frame(&mut frame).await.unwrap());
    }
}
