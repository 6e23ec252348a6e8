//! Idle pool of encrypted upstream connections for the forward proxy.
//!
//! A single actor task owns the pool map; `get`, `release` and `delete`
//! arrive as messages on its inbox, and each parked entry gets a watcher
//! task that can only message `kill` back through that same inbox. One
//! writer, no locks, and no watcher-to-pool back-pointers. Reuse is LIFO,
//! since the most recently parked connection is the most likely to still
//! be open on the far side.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::addr;
use crate::common::{Error, Result};
use crate::crypto::replay::ReplayFilter;
use crate::crypto::CipherFactory;
use crate::net::delay_init::DelayInitWriter;
use crate::net::{dial, PlainTransport, SecureReadHalf, SecureWriteHalf};

/// How long a released connection may sit idle before it is closed.
pub const IDLE_TTL: Duration = Duration::from_secs(5);

/// One pooled (or checked-out) upstream connection. The writer still owes
/// the server its address prefix until the first write goes out.
pub struct PooledConn {
    pub(crate) addr: String,
    pub(crate) reader: SecureReadHalf,
    pub(crate) writer: DelayInitWriter<SecureWriteHalf>,
}

impl PooledConn {
    pub async fn alive(&mut self) -> bool {
        self.reader.alive().await
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn halves_mut(
        &mut self,
    ) -> (&mut SecureReadHalf, &mut DelayInitWriter<SecureWriteHalf>) {
        (&mut self.reader, &mut self.writer)
    }
}

enum Command {
    Get {
        authority: String,
        reply: oneshot::Sender<Result<PooledConn>>,
    },
    Release(PooledConn),
    Delete {
        done: oneshot::Sender<()>,
    },
    Kill {
        authority: String,
        id: u64,
    },
    #[cfg(test)]
    IdleCount {
        reply: oneshot::Sender<usize>,
    },
}

pub struct ConnectionManager {
    inbox: mpsc::Sender<Command>,
}

impl ConnectionManager {
    pub fn new(
        server_addr: String,
        cipher: CipherFactory,
        replay: Arc<dyn ReplayFilter>,
    ) -> Self {
        let (inbox, commands) = mpsc::channel(16);
        let actor = PoolActor {
            server_addr,
            cipher,
            replay,
            inbox: inbox.clone(),
            next_id: 0,
            conns: HashMap::new(),
        };
        tokio::spawn(actor.run(commands));
        Self { inbox }
    }

    /// Checks out a live connection for `authority`, reusing a pooled one
    /// when possible. An entry that died while parked is discarded and the
    /// request repeated, falling back to a fresh dial.
    pub async fn get(&self, authority: &str) -> Result<PooledConn> {
        loop {
            let (reply, response) = oneshot::channel();
            self.inbox
                .send(Command::Get {
                    authority: authority.to_string(),
                    reply,
                })
                .await
                .map_err(|_| Error::ManagerDead)?;
            let mut conn = response.await.map_err(|_| Error::ManagerDead)??;
            if conn.alive().await {
                return Ok(conn);
            }
            // died while parked; dropping closes it, ask again
        }
    }

    /// Parks a connection for reuse. Dead connections and a dead manager
    /// both just close it.
    pub async fn release(&self, mut conn: PooledConn) {
        if !conn.alive().await {
            return;
        }
        // on a dead manager the send fails and the drop closes the socket
        let _ = self.inbox.send(Command::Release(conn)).await;
    }

    /// Shuts the pool down: every idle connection is closed and later
    /// `get`s fail with [`Error::ManagerDead`].
    pub async fn delete(&self) {
        let (done, finished) = oneshot::channel();
        if self.inbox.send(Command::Delete { done }).await.is_ok() {
            let _ = finished.await;
        }
    }

    #[cfg(test)]
    async fn idle_count(&self) -> usize {
        let (reply, response) = oneshot::channel();
        if self.inbox.send(Command::IdleCount { reply }).await.is_err() {
            return 0;
        }
        response.await.unwrap_or(0)
    }
}

struct PooledEntry {
    id: u64,
    conn: PooledConn,
    watcher: CancellationToken,
}

/// The single owner of the pool map. Lives until `Delete`.
struct PoolActor {
    server_addr: String,
    cipher: CipherFactory,
    replay: Arc<dyn ReplayFilter>,
    /// Handed to watcher tasks so expiry comes back as a `Kill` message.
    inbox: mpsc::Sender<Command>,
    next_id: u64,
    conns: HashMap<String, Vec<PooledEntry>>,
}

impl PoolActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Get { authority, reply } => {
                    let _ = reply.send(self.checkout(&authority).await);
                }
                Command::Release(conn) => self.park(conn),
                Command::Kill { authority, id } => self.expire(&authority, id),
                Command::Delete { done } => {
                    self.close_all();
                    let _ = done.send(());
                    return;
                }
                #[cfg(test)]
                Command::IdleCount { reply } => {
                    let _ = reply.send(self.conns.values().map(Vec::len).sum());
                }
            }
        }
    }

    /// Pops the most recently parked entry, or dials a fresh connection.
    /// Liveness is the caller's problem, keeping the actor off the probe's
    /// await.
    async fn checkout(&mut self, authority: &str) -> Result<PooledConn> {
        if let Some(queue) = self.conns.get_mut(authority) {
            if let Some(entry) = queue.pop() {
                if queue.is_empty() {
                    self.conns.remove(authority);
                }
                entry.watcher.cancel();
                debug!(addr = authority, "http pool hit");
                return Ok(entry.conn);
            }
        }
        self.dial_upstream(authority).await
    }

    async fn dial_upstream(&self, authority: &str) -> Result<PooledConn> {
        let (host, port) = addr::split_authority(authority, 80)?;
        let mut prefix = BytesMut::new();
        addr::encode_target(&host, port, &mut prefix)?;

        let stream = dial(&self.server_addr).await?;
        let plain = PlainTransport::connected(stream)?;
        let secure = self.cipher.wrap(plain, self.replay.clone());
        let (reader, write_half) = secure.split();
        debug!(addr = authority, "http pool dialed new upstream");
        Ok(PooledConn {
            addr: authority.to_string(),
            reader,
            writer: DelayInitWriter::new(write_half, prefix.to_vec()),
        })
    }

    fn park(&mut self, conn: PooledConn) {
        let id = self.next_id;
        self.next_id += 1;
        let token = CancellationToken::new();
        let authority = conn.addr.clone();
        self.conns
            .entry(authority.clone())
            .or_default()
            .push(PooledEntry {
                id,
                conn,
                watcher: token.clone(),
            });

        // the watcher holds a send-handle and nothing else
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(IDLE_TTL) => {
                    let _ = inbox.send(Command::Kill { authority, id }).await;
                }
                _ = token.cancelled() => {}
            }
        });
    }

    fn expire(&mut self, authority: &str, id: u64) {
        if let Some(queue) = self.conns.get_mut(authority) {
            // checkout may have raced the watcher; a missing id is fine
            if let Some(pos) = queue.iter().position(|entry| entry.id == id) {
                debug!(addr = authority, "http pool idle connection expired");
                queue.swap_remove(pos);
            }
            if queue.is_empty() {
                self.conns.remove(authority);
            }
        }
    }

    fn close_all(&mut self) {
        for (_, queue) in self.conns.drain() {
            for entry in queue {
                entry.watcher.cancel();
                // dropping the entry closes the connection
            }
        }
    }
}
