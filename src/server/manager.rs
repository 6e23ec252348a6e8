//! Multi-port server orchestration and the control listener.
//!
//! `port_password` configs yield one [`ServerContext`] per port, all
//! registered here. The control channel is deliberately minimal: only
//! `ping` is answered (`pong`); everything else is ignored.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::ServerContext;
use crate::addr::pack_addr;
use crate::common::{Error, Result};
use crate::config::Config;
use crate::runtime::Runtime;

struct ServerHandle {
    ctx: Arc<ServerContext>,
    task: tokio::task::JoinHandle<()>,
}

pub struct ServerManager {
    runtime: Arc<Runtime>,
    servers: Mutex<HashMap<String, ServerHandle>>,
}

impl ServerManager {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Binds and starts a server for `config`, keyed by its listen
    /// address.
    pub async fn add(&self, config: &Config) -> Result<()> {
        let key = pack_addr(&config.server_host, config.server_port);
        let ctx = Arc::new(ServerContext::new(config, self.runtime.clone()).await?);
        let runner = ctx.clone();
        let task = tokio::spawn(async move { runner.run().await });
        info!(addr = %key, "server registered");
        self.servers.lock().await.insert(key, ServerHandle { ctx, task });
        Ok(())
    }

    /// Stops and forgets the server listening on `host:port`.
    pub async fn remove(&self, host: &str, port: u16) -> Result<()> {
        let key = pack_addr(host, port);
        let handle = self
            .servers
            .lock()
            .await
            .remove(&key)
            .ok_or(Error::ServerDoesNotExist)?;
        handle.ctx.stop();
        let _ = handle.ctx.wait().await;
        handle.task.abort();
        info!(addr = %key, "server removed");
        Ok(())
    }

    pub async fn server_count(&self) -> usize {
        self.servers.lock().await.len()
    }

    /// Stops every registered server.
    pub async fn stop_all(&self) {
        let mut servers = self.servers.lock().await;
        for (key, handle) in servers.drain() {
            handle.ctx.stop();
            let _ = handle.ctx.wait().await;
            handle.task.abort();
            debug!(addr = %key, "server stopped");
        }
    }

    /// Serves the management channel on `addr`: a UDP endpoint, or a Unix
    /// datagram socket when the address contains a path separator. Only
    /// `ping` → `pong` is implemented; other commands are external
    /// collaborators and get no reply.
    pub async fn listen(&self, addr: &str) -> Result<()> {
        if addr.contains('/') {
            let _ = std::fs::remove_file(addr);
            let socket = tokio::net::UnixDatagram::bind(addr)?;
            info!(addr = %addr, "manager listening on unix socket");
            let mut packet = [0u8; 1024];
            loop {
                let (n, peer) = socket.recv_from(&mut packet).await?;
                if let Some(reply) = control_reply(&packet[..n]) {
                    if let Some(path) = peer.as_pathname() {
                        let _ = socket.send_to(reply, path).await;
                    }
                }
            }
        } else {
            let socket = tokio::net::UdpSocket::bind(addr).await?;
            info!(addr = %addr, "manager listening on udp");
            let mut packet = [0u8; 1024];
            loop {
                let (n, peer) = socket.recv_from(&mut packet).await?;
                if let Some(reply) = control_reply(&packet[..n]) {
                    let _ = socket.send_to(reply, peer).await;
                }
            }
        }
    }
}

fn control_reply(command: &[u8]) -> Option<&'static [u8]> {
    match std::str::from_utf8(command).map(str::trim) {
        Ok("ping") => Some(b"pong"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::init_runtime;

    #[test]
    fn ping_gets_pong() {
        assert_eq!(control_reply(b"ping"), Some(&b"pong"[..]));
        assert_eq!(control_reply(b"ping\n"), Some(&b"pong"[..]));
        assert_eq!(control_reply(b"add: {}"), None);
        assert_eq!(control_reply(&[0xff, 0xfe]), None);
    }

    #[tokio::test]
    async fn add_and_remove_servers() {
        let runtime = init_runtime(16, false);
        let manager = ServerManager::new(runtime);

        let config = Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            password: "testkey".to_string(),
            ..Config::default()
        };

        // port 0 binds an ephemeral port; recover it for removal
        manager.add(&config).await.unwrap();
        assert_eq!(manager.server_count().await, 1);

        let addr = {
            let servers = manager.servers.lock().await;
            servers.values().next().unwrap().ctx.local_addr().unwrap()
        };
        assert!(matches!(
            manager.remove("127.0.0.1", 1).await,
            Err(Error::ServerDoesNotExist)
        ));
        // registered under port 0 as configured
        let _ = addr;
        manager.remove("127.0.0.1", 0).await.unwrap();
        assert_eq!(manager.server_count().await, 0);
    }

    #[tokio::test]
    async fn manager_udp_ping() {
        let runtime = init_runtime(16, false);
        let manager = Arc::new(ServerManager::new(runtime));

        let control = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let control_addr = control.local_addr().unwrap();
        drop(control);

        let m = manager.clone();
        let addr = control_addr.to_string();
        tokio::spawn(async move {
            let _ = m.listen(&addr).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        client.send_to(b"ping", control_addr).await.unwrap();
        let mut reply = [0u8; 16];
        let (n, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            client.recv_from(&mut reply),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&reply[..n], b"pong");
    }
}
