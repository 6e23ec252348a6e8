//! Remote endpoint: decrypts the tunnel, dials the real destination and
//! bridges the two.
//!
//! The server never answers an unauthenticated peer. A connection that
//! fails authentication is *drained*: the socket stays open and incoming
//! bytes are discarded until the peer gives up, so a probe cannot tell a
//! wrong key apart from a slow service by timing or resets.

pub mod manager;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::addr::{self, ParsedAddr};
use crate::common::{Buffer, Error, Result, DEFAULT_BUF_SIZE};
use crate::config::Config;
use crate::crypto::CipherFactory;
use crate::net::{
    bidirectional_pipe, dial_destination, PlainTransport, ReadTransport, SecureTransport,
};
use crate::runtime::Runtime;

struct ServerShared {
    listener: TcpListener,
    cipher: CipherFactory,
    timeout: Duration,
    connect_timeout: Duration,
    v4_only: bool,
    runtime: Arc<Runtime>,
    cancel: CancellationToken,
    running: AtomicBool,
}

pub struct ServerContext {
    shared: Arc<ServerShared>,
    err_tx: mpsc::Sender<Result<()>>,
    err_rx: Mutex<mpsc::Receiver<Result<()>>>,
}

impl ServerContext {
    pub async fn new(config: &Config, runtime: Arc<Runtime>) -> Result<Self> {
        let cipher = CipherFactory::new(&config.method, &config.password, config.key_b64())?;
        let listener =
            TcpListener::bind(crate::addr::pack_addr(&config.server_host, config.server_port))
                .await?;
        let (err_tx, err_rx) = mpsc::channel(1);
        Ok(Self {
            shared: Arc::new(ServerShared {
                listener,
                cipher,
                timeout: config.timeout(),
                connect_timeout: config.connect_timeout(),
                v4_only: config.v4_only,
                runtime,
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

    /// Accept loop; one task per connection, FD-gated.
    pub async fn run(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("server is already running");
            return;
        }
        info!(addr = ?self.local_addr(), "server listening");

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
                        if let Err(e) = handle_connection(&shared, stream, peer).await {
                            info!(peer = %peer, error = %e, "server session ended with error");
                        }
                    });
                }
                Err(e) => break Err(Error::Io(e)),
            }
        };

        let _ = self.err_tx.send(result).await;
    }

    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.err_rx.lock().await;
        rx.recv().await.unwrap_or(Ok(()))
    }
}

async fn handle_connection(
    shared: &ServerShared,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let plain = PlainTransport::accepted(stream, shared.timeout)?;
    let mut secure = shared
        .cipher
        .wrap(plain, shared.runtime.replay.clone());

    match serve_tunnel(shared, &mut secure).await {
        Err(e) if e.is_auth() => {
            warn!(peer = %peer, error = %e, "authentication failed, holding connection");
            drain_and_hold(secure).await;
            Ok(())
        }
        other => other,
    }
}

async fn serve_tunnel(shared: &ServerShared, secure: &mut SecureTransport) -> Result<()> {
    let mut buf = Buffer::new();

    // the first chunks carry the destination address
    let target = loop {
        if secure.read(&mut buf).await? == 0 {
            // peer went away before naming a destination
            return Ok(());
        }
        match addr::parse_address(buf.as_slice())? {
            ParsedAddr::Full { addr, consumed } => {
                buf.consume(consumed);
                break addr;
            }
            ParsedAddr::Partial { .. } => continue,
        }
    };

    let (host, port) = addr::split_authority(&target, 0)?;
    debug!(target = %target, "server dialing destination");
    let outbound = dial_destination(&host, port, shared.v4_only, shared.connect_timeout).await?;
    let remote = PlainTransport::connected(outbound)?;

    let (mut r_reader, mut r_writer) = remote.split();
    let (s_reader, s_writer) = secure.halves_mut();
    let mut rbuf = Buffer::new();
    bidirectional_pipe(s_reader, s_writer, &mut r_reader, &mut r_writer, &mut buf, &mut rbuf).await
}

/// Reads and discards until the peer closes. Both socket halves stay open
/// the whole time: no FIN, no reset, no reply.
async fn drain_and_hold(secure: SecureTransport) {
    let (mut reader, _writer) = secure.into_plain_halves();
    let mut devnull = Buffer::with_capacity(DEFAULT_BUF_SIZE);
    loop {
        devnull.clear();
        match reader.read(&mut devnull).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}
