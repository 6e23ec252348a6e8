//! End-to-end scenarios: an in-process HTTP origin, a Shadowsocks server
//! and a client, exercised through real sockets via every supported local
//! dialect.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use ssrelay::client::ClientContext;
use ssrelay::config::Config;
use ssrelay::crypto::replay::{BloomReplayFilter, NoopReplayFilter, ReplayFilter};
use ssrelay::crypto::{derive_subkey, evp_bytes_to_key, AeadCipher, CipherKind};
use ssrelay::runtime::{init_runtime_with, Runtime};
use ssrelay::server::ServerContext;

const METHOD: &str = "chacha20-ietf-poly1305";
const PASSWORD: &str = "testkey";

/// Minimal keep-alive HTTP origin serving `GET /hello` → `Hello`.
/// Returns its port and an accepted-connections counter.
async fn spawn_origin(bind: &str) -> std::io::Result<(u16, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind((bind, 0)).await?;
    let port = listener.local_addr()?.port();
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = accepts.clone();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut pending: Vec<u8> = Vec::new();
                loop {
                    // one request header
                    while !pending.windows(4).any(|w| w == b"\r\n\r\n") {
                        let mut chunk = [0u8; 2048];
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => pending.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let end = pending
                        .windows(4)
                        .position(|w| w == b"\r\n\r\n")
                        .map(|p| p + 4)
                        .unwrap_or(pending.len());
                    let request = String::from_utf8_lossy(&pending[..end]).to_string();
                    pending.drain(..end);

                    let close = request.to_ascii_lowercase().contains("connection: close");
                    let conn_header = if close { "close" } else { "keep-alive" };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: {}\r\n\r\nHello",
                        conn_header
                    );
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                    if close {
                        return;
                    }
                }
            });
        }
    });

    Ok((port, accepts))
}

struct Stack {
    client_port: u16,
    server_port: u16,
    client: Arc<ClientContext>,
    server: Arc<ServerContext>,
    _runtime: Arc<Runtime>,
}

async fn spawn_stack(replay: Arc<dyn ReplayFilter>) -> Stack {
    let runtime = init_runtime_with(256, replay, Duration::from_secs(1800));

    let server_config = Config {
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        password: PASSWORD.to_string(),
        method: METHOD.to_string(),
        ..Config::default()
    };
    let server = Arc::new(ServerContext::new(&server_config, runtime.clone()).await.unwrap());
    let server_port = server.local_addr().unwrap().port();

    let client_config = Config {
        server_host: "127.0.0.1".to_string(),
        server_port,
        local_host: "127.0.0.1".to_string(),
        local_port: 0,
        password: PASSWORD.to_string(),
        method: METHOD.to_string(),
        ..Config::default()
    };
    let client = Arc::new(ClientContext::new(&client_config, runtime.clone()).await.unwrap());
    let client_port = client.local_addr().unwrap().port();

    let server_task = server.clone();
    tokio::spawn(async move { server_task.run().await });
    let client_task = client.clone();
    tokio::spawn(async move { client_task.run().await });

    Stack {
        client_port,
        server_port,
        client,
        server,
        _runtime: runtime,
    }
}

async fn default_stack() -> Stack {
    spawn_stack(Arc::new(NoopReplayFilter)).await
}

/// Reads one `Content-Length`-framed HTTP response off the stream.
async fn read_http_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        let mut chunk = [0u8; 2048];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed inside response header");
        raw.extend_from_slice(&chunk[..n]);
    }
    let header_end = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let header = String::from_utf8_lossy(&raw[..header_end]).to_string();

    let content_length: usize = header
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .expect("response carries a content-length");

    let mut body = raw[header_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0u8; 2048];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed inside response body");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    (header, body)
}

async fn socks5_connect_ipv4(client_port: u16, target_port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", client_port)).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await.unwrap();
    assert_eq!(greeting, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x05, 0x00]);
    stream
}

#[tokio::test]
async fn socks5_get_through_tunnel() {
    let (origin_port, _) = spawn_origin("127.0.0.1").await.unwrap();
    let stack = default_stack().await;

    let mut stream = socks5_connect_ipv4(stack.client_port, origin_port).await;
    let request = format!(
        "GET /hello HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        origin_port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let (header, body) = read_http_response(&mut stream).await;
    assert!(header.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"Hello");
}

#[tokio::test]
async fn socks4a_get_through_tunnel() {
    let (origin_port, _) = spawn_origin("127.0.0.1").await.unwrap();
    let stack = default_stack().await;

    let mut stream = TcpStream::connect(("127.0.0.1", stack.client_port)).await.unwrap();
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&origin_port.to_be_bytes());
    request.extend_from_slice(&[0, 0, 0, 1]); // SOCKS4a marker address
    request.extend_from_slice(b"tester\0");
    request.extend_from_slice(b"localhost\0");
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x00, 0x5A]);

    let get = format!(
        "GET /hello HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n",
        origin_port
    );
    stream.write_all(get.as_bytes()).await.unwrap();
    let (header, body) = read_http_response(&mut stream).await;
    assert!(header.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"Hello");
}

#[tokio::test]
async fn plain_socks4_get_through_tunnel() {
    let (origin_port, _) = spawn_origin("127.0.0.1").await.unwrap();
    let stack = default_stack().await;

    let mut stream = TcpStream::connect(("127.0.0.1", stack.client_port)).await.unwrap();
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&origin_port.to_be_bytes());
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(b"tester\0");
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x00, 0x5A]);

    let get = format!(
        "GET /hello HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        origin_port
    );
    stream.write_all(get.as_bytes()).await.unwrap();
    let (_, body) = read_http_response(&mut stream).await;
    assert_eq!(body, b"Hello");
}

#[tokio::test]
async fn forward_proxy_ten_sequential_requests_reuse_upstream() {
    let (origin_port, accepts) = spawn_origin("127.0.0.1").await.unwrap();
    let stack = default_stack().await;

    let mut stream = TcpStream::connect(("127.0.0.1", stack.client_port)).await.unwrap();
    for _ in 0..10 {
        let request = format!(
            "GET http://127.0.0.1:{port}/hello HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
            port = origin_port
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let (header, body) = read_http_response(&mut stream).await;
        assert!(header.starts_with("HTTP/1.1 200"));
        assert_eq!(body, b"Hello");
    }
    drop(stream);

    // all ten requests travelled one pooled upstream connection
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forward_proxy_post_with_body() {
    let (origin_port, _) = spawn_origin("127.0.0.1").await.unwrap();
    let stack = default_stack().await;

    let mut stream = TcpStream::connect(("127.0.0.1", stack.client_port)).await.unwrap();
    let request = format!(
        "POST http://127.0.0.1:{port}/hello HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nContent-Length: 7\r\n\r\npayload",
        port = origin_port
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let (header, body) = read_http_response(&mut stream).await;
    assert!(header.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"Hello");
}

#[tokio::test]
async fn http_connect_tunnel() {
    let (origin_port, _) = spawn_origin("127.0.0.1").await.unwrap();
    let stack = default_stack().await;

    let mut stream = TcpStream::connect(("127.0.0.1", stack.client_port)).await.unwrap();
    let connect = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = origin_port
    );
    stream.write_all(connect.as_bytes()).await.unwrap();

    let mut established = Vec::new();
    while !established.windows(4).any(|w| w == b"\r\n\r\n") {
        let mut chunk = [0u8; 256];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        established.extend_from_slice(&chunk[..n]);
    }
    assert!(String::from_utf8_lossy(&established).starts_with("HTTP/1.1 200"));

    let get = format!(
        "GET /hello HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        origin_port
    );
    stream.write_all(get.as_bytes()).await.unwrap();
    let (_, body) = read_http_response(&mut stream).await;
    assert_eq!(body, b"Hello");
}

#[tokio::test]
async fn socks5_ipv6_origin() {
    // environments without a loopback v6 stack skip quietly
    let Ok((origin_port, _)) = spawn_origin("::1").await else {
        eprintln!("skipping: IPv6 loopback unavailable");
        return;
    };
    let stack = default_stack().await;

    let mut stream = TcpStream::connect(("127.0.0.1", stack.client_port)).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x04];
    request.extend_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
    request.extend_from_slice(&origin_port.to_be_bytes());
    stream.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x05, 0x00]);

    let get = format!(
        "GET /hello HTTP/1.1\r\nHost: [::1]:{}\r\nConnection: close\r\n\r\n",
        origin_port
    );
    stream.write_all(get.as_bytes()).await.unwrap();
    let (_, body) = read_http_response(&mut stream).await;
    assert_eq!(body, b"Hello");
}

#[tokio::test]
async fn hundred_parallel_socks5_sessions() {
    let (origin_port, _) = spawn_origin("127.0.0.1").await.unwrap();
    let stack = Arc::new(default_stack().await);

    let mut tasks = Vec::new();
    for i in 0..100u32 {
        let client_port = stack.client_port;
        tasks.push(tokio::spawn(async move {
            let mut stream = socks5_connect_ipv4(client_port, origin_port).await;
            let request = format!(
                "GET /hello HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nX-Session: {}\r\nConnection: close\r\n\r\n",
                origin_port, i
            );
            stream.write_all(request.as_bytes()).await.unwrap();
            let (_, body) = read_http_response(&mut stream).await;
            assert_eq!(body, b"Hello");
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn stopping_client_drains_and_waits_clean() {
    let (origin_port, _) = spawn_origin("127.0.0.1").await.unwrap();
    let stack = default_stack().await;

    // leave a session in flight
    let mut stream = socks5_connect_ipv4(stack.client_port, origin_port).await;

    stack.client.stop();
    tokio::time::timeout(Duration::from_secs(2), stack.client.wait())
        .await
        .expect("wait() should return after stop()")
        .expect("clean shutdown");

    // the in-flight session still completes its request
    let request = format!(
        "GET /hello HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        origin_port
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let (_, body) = read_http_response(&mut stream).await;
    assert_eq!(body, b"Hello");

    stack.server.stop();
    tokio::time::timeout(Duration::from_secs(2), stack.server.wait())
        .await
        .expect("server wait() should return")
        .expect("clean shutdown");
}

#[tokio::test]
async fn replayed_first_chunk_is_drained_not_served() {
    let (origin_port, accepts) = spawn_origin("127.0.0.1").await.unwrap();
    let replay: Arc<dyn ReplayFilter> = Arc::new(BloomReplayFilter::with_rate(10_000, 1e-6));
    let stack = spawn_stack(replay).await;

    // hand-roll a valid first flight for the server
    let kind = CipherKind::ChaCha20Poly1305;
    let key = evp_bytes_to_key(PASSWORD.as_bytes(), kind.key_len());
    let salt: Vec<u8> = (0..kind.salt_len() as u8).collect();
    let subkey = derive_subkey(&key, &salt, kind.key_len()).unwrap();
    let mut cipher = AeadCipher::new(kind, subkey);

    let mut payload = vec![0x01, 127, 0, 0, 1];
    payload.extend_from_slice(&origin_port.to_be_bytes());
    payload.extend_from_slice(
        format!(
            "GET /hello HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
            origin_port
        )
        .as_bytes(),
    );

    let mut wire = salt.clone();
    wire.extend_from_slice(&cipher.encrypt(&(payload.len() as u16).to_be_bytes()).unwrap());
    wire.extend_from_slice(&cipher.encrypt(&payload).unwrap());

    // first delivery is served normally
    let mut first = TcpStream::connect(("127.0.0.1", stack.server_port)).await.unwrap();
    first.write_all(&wire).await.unwrap();
    let mut response = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), first.read(&mut response))
        .await
        .expect("server answers a fresh salt")
        .unwrap();
    assert!(n > 0);
    drop(first);
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    // the replay gets silence: no data, no close, no second origin hit
    let mut second = TcpStream::connect(("127.0.0.1", stack.server_port)).await.unwrap();
    second.write_all(&wire).await.unwrap();
    let silent =
        tokio::time::timeout(Duration::from_millis(500), second.read(&mut response)).await;
    assert!(silent.is_err(), "server must not answer a replayed salt");

    // the connection is still writable (drained, not reset)
    second.write_all(b"more bytes").await.unwrap();
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}
