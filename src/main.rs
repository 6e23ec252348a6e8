use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ssrelay::client::ClientContext;
use ssrelay::config::Config;
use ssrelay::crypto::Method;
use ssrelay::runtime::{init_runtime, DEFAULT_MAX_CONNECTIONS};
use ssrelay::server::manager::ServerManager;

#[derive(Parser)]
#[command(
    name = "ssrelay",
    version,
    about = "Shadowsocks TCP relay (client and server)",
    after_help = supported_methods_help()
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (JSON)
    #[arg(short = 'c', long, global = true)]
    config: Option<String>,

    /// Server host name or IP address
    #[arg(short = 's', long, global = true)]
    server_host: Option<String>,

    /// Server port number
    #[arg(short = 'p', long, global = true)]
    server_port: Option<u16>,

    /// Client bind host or IP
    #[arg(short = 'b', long, global = true)]
    local_host: Option<String>,

    /// Client listening port
    #[arg(short = 'l', long, global = true)]
    local_port: Option<u16>,

    /// Password of your server
    #[arg(short = 'k', long, global = true)]
    password: Option<String>,

    /// Key of your server, in base64
    #[arg(long, global = true)]
    key: Option<String>,

    /// Encryption method
    #[arg(short = 'm', long, global = true)]
    method: Option<String>,

    /// Socket timeout in seconds
    #[arg(short = 't', long, global = true)]
    timeout: Option<u64>,

    /// Proxy IPv4 destinations only (the server may still listen on IPv6)
    #[arg(long, global = true)]
    v4only: bool,

    /// Manager API address, a UDP endpoint or a unix socket path
    #[arg(long, global = true)]
    manager_address: Option<String>,

    /// Maximum number of concurrently handled connections
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_conn: usize,

    /// Verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the local endpoint (SOCKS/HTTP/redirect proxy)
    Local,
    /// Run the remote endpoint
    Server,
}

fn supported_methods_help() -> String {
    let mut help = String::from("Supported encryption methods:\n");
    for name in Method::supported() {
        help.push_str("  ");
        help.push_str(name);
        help.push('\n');
    }
    help
}

fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    };
    if let Some(host) = &cli.server_host {
        config.server_host = host.clone();
    }
    if let Some(port) = cli.server_port {
        config.server_port = port;
    }
    if let Some(host) = &cli.local_host {
        config.local_host = host.clone();
    }
    if let Some(port) = cli.local_port {
        config.local_port = port;
    }
    if let Some(password) = &cli.password {
        config.password = password.clone();
    }
    if let Some(key) = &cli.key {
        config.key = key.clone();
    }
    if let Some(method) = &cli.method {
        config.method = method.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_seconds = timeout;
    }
    if cli.v4only {
        config.v4_only = true;
    }
    if config.password.is_empty() && config.key.is_empty() && config.port_password.is_none() {
        bail!("no password or key configured");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("ssrelay={}", default_level))),
        )
        .init();

    let config = build_config(&cli)?;
    let runtime = init_runtime(cli.max_conn, true);

    match cli.command {
        Commands::Server => {
            let manager = Arc::new(ServerManager::new(runtime.clone()));
            let port_passwords = config.port_passwords()?;
            if port_passwords.is_empty() {
                manager.add(&config).await?;
            } else {
                for (port, password) in port_passwords {
                    let mut entry = config.clone();
                    entry.server_port = port;
                    entry.password = password;
                    entry.key.clear();
                    manager.add(&entry).await?;
                }
            }

            if let Some(addr) = &cli.manager_address {
                let control = manager.clone();
                let addr = addr.clone();
                tokio::spawn(async move {
                    if let Err(e) = control.listen(&addr).await {
                        tracing::error!(error = %e, "manager listener failed");
                    }
                });
            }

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            manager.stop_all().await;
            runtime.shutdown();
        }
        Commands::Local => {
            let client = Arc::new(ClientContext::new(&config, runtime.clone()).await?);
            let runner = client.clone();
            let task = tokio::spawn(async move { runner.run().await });

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    client.stop();
                }
                result = client.wait() => {
                    result?;
                }
            }
            client.stop();
            let _ = client.wait().await;
            let _ = task.await;
            runtime.shutdown();
        }
    }
    Ok(())
}
