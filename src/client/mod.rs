//! Local proxy endpoint.
//!
//! Accepts plaintext proxy dialects (SOCKS4/4a, SOCKS5, HTTP, and on Linux
//! transparent redirects), translates each into the Shadowsocks address
//! form and relays the session over an encrypted connection to the server.

pub mod detect;
pub mod http;
#[cfg(target_os = "linux")]
pub mod redir;
pub(crate) mod socks;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{Buffer, Error, Result};
use crate::config::Config;
use crate::crypto::CipherFactory;
use crate::net::{bidirectional_pipe, dial, PlainTransport, ReadTransport, SecureTransport};
use crate::runtime::Runtime;
use self::http::ConnectionManager;

/// How long a handler waits for payload the client may have sent right
/// behind its handshake, so those bytes share the first encrypted chunk.
pub(crate) const PEEK_MILLIS: u64 = 5;

pub(crate) struct ClientShared {
    listener: TcpListener,
    server_addr: String,
    cipher: CipherFactory,
    timeout: Duration,
    runtime: Arc<Runtime>,
    http_manager: ConnectionManager,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl ClientShared {
    pub(crate) async fn dial_server(&self) -> Result<SecureTransport> {
        let stream = dial(&self.server_addr).await?;
        let plain = PlainTransport::connected(stream)?;
        Ok(self.cipher.wrap(plain, self.runtime.replay.clone()))
    }

    pub(crate) fn http_manager(&self) -> &ConnectionManager {
        &self.http_manager
    }
}

pub struct ClientContext {
    shared: Arc<ClientShared>,
    err_tx: mpsc::Sender<Result<()>>,
    err_rx: Mutex<mpsc::Receiver<Result<()>>>,
}

impl ClientContext {
    /// Binds the local listener and prepares the cipher. The context is
    /// idle until [`run`](Self::run).
    pub async fn new(config: &Config, runtime: Arc<Runtime>) -> Result<Self> {
        let cipher = CipherFactory::new(&config.method, &config.password, config.key_b64())?;
        let listener =
            TcpListener::bind(crate::addr::pack_addr(&config.local_host, config.local_port))
                .await?;
        let server_addr = crate::addr::pack_addr(&config.server_host, config.server_port);
        let http_manager =
            ConnectionManager::new(server_addr.clone(), cipher.clone(), runtime.replay.clone());
        let (err_tx, err_rx) = mpsc::channel(1);
        Ok(Self {
            shared: Arc::new(ClientShared {
                listener,
                server_addr,
                cipher,
                timeout: config.timeout(),
                runtime,
                http_manager,
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
            }),
            err_tx,
            err_rx: Mutex::new(err_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.listener.local_addr()?)
    }

    /// Accept loop. Runs until [`stop`](Self::stop) or a fatal listener
    /// error; in-flight handlers finish their sessions either way.
    pub async fn run(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("client is already running");
            return;
        }
        info!(addr = ?self.local_addr(), server = %self.shared.server_addr, "client listening");

        let result = loop {
            let permit = self.shared.runtime.fd_gate.acquire().await;
            let accepted = tokio::select! {
                accepted = self.shared.listener.accept() => accepted,
                _ = self.shared.cancel.cancelled() => break Ok(()),
            };
            match accepted {
                Ok((stream, peer)) => {
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_connection(&shared, stream).await {
                            info!(peer = %peer, error = %e, "client session ended with error");
                        }
                    });
                }
                Err(e) => break Err(Error::Io(e)),
            }
        };

        self.shared.http_manager.delete().await;
        let _ = self.err_tx.send(result).await;
    }

    /// Stops the accept loop. Idempotent.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    /// Blocks until the accept loop has exited and yields its verdict:
    /// `Ok` for a clean stop, the listener error otherwise.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.err_rx.lock().await;
        rx.recv().await.unwrap_or(Ok(()))
    }
}

async fn handle_connection(shared: &ClientShared, stream: TcpStream) -> Result<()> {
    #[cfg(target_os = "linux")]
    let redirected = redir::detect_redir(&stream);

    let mut tconn = PlainTransport::accepted(stream, shared.timeout)?;
    let mut buf = Buffer::new();

    #[cfg(target_os = "linux")]
    if let Some(original) = redirected {
        return redir::handle_redir(shared, tconn, buf, original).await;
    }

    loop {
        if tconn.read(&mut buf).await? == 0 {
            // closed before any recognisable handshake
            return Ok(());
        }
        if detect::detect_socks5(&buf) {
            return socks::handle_socks5(shared, tconn, buf).await;
        }
        if detect::detect_socks4(&buf) {
            return socks::handle_socks4(shared, tconn, buf).await;
        }
        if detect::detect_http(&buf) {
            return http::engine::handle_http(shared, tconn, buf).await;
        }
        debug!(buffered = buf.len(), "protocol not recognised yet, reading more");
    }
}

/// Reads at least one more byte into `buf`, treating EOF as a broken
/// handshake.
pub(crate) async fn read_more(tconn: &mut PlainTransport, buf: &mut Buffer) -> Result<()> {
    if tconn.read(buf).await? == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed during handshake",
        )));
    }
    Ok(())
}

/// Dials the server and bridges the two sides until either closes. The
/// forward buffer usually already carries the address prefix (plus any
/// peeked payload) as its first encrypted chunk.
pub(crate) async fn tunnel(
    shared: &ClientShared,
    tconn: PlainTransport,
    mut buf: Buffer,
    mut rbuf: Buffer,
) -> Result<()> {
    let server = shared.dial_server().await?;
    let (mut t_reader, mut t_writer) = tconn.split();
    let (mut s_reader, mut s_writer) = server.split();
    rbuf.clear();
    bidirectional_pipe(
        &mut t_reader,
        &mut t_writer,
        &mut s_reader,
        &mut s_writer,
        &mut buf,
        &mut rbuf,
    )
    .await
}
