//! HTTP proxy engine: CONNECT tunneling and forward proxying with
//! persistent, pooled upstream connections.

use bytes::BytesMut;
use tracing::debug;

use super::header::{self, HttpHeader};
use super::pool::PooledConn;
use crate::addr;
use crate::client::{tunnel, ClientShared, PEEK_MILLIS};
use crate::common::{Buffer, Error, Result};
use crate::net::{PlainTransport, WriteTransport};

/// Serves one client connection: a sequence of proxied requests ending at
/// client EOF, a CONNECT upgrade, or an error.
pub(crate) async fn handle_http(
    shared: &ClientShared,
    mut tconn: PlainTransport,
    mut buf: Buffer,
) -> Result<()> {
    let mut upstream: Option<PooledConn> = None;

    loop {
        let mut request = match header::parse_header(&mut tconn, &mut buf, true).await {
            Ok(Some(h)) => h,
            Ok(None) => {
                // client is done with this session
                if let Some(conn) = upstream.take() {
                    shared.http_manager().release(conn).await;
                }
                return Ok(());
            }
            Err(e) => {
                let _ = header::write_400(&mut tconn).await;
                return Err(e);
            }
        };

        let method = match request.method() {
            Ok(m) => m.to_string(),
            Err(e) => {
                let _ = header::write_400(&mut tconn).await;
                return Err(e);
            }
        };

        if method == "CONNECT" {
            // CONNECT never uses the pool; any held upstream goes back
            if let Some(conn) = upstream.take() {
                shared.http_manager().release(conn).await;
            }
            return handle_connect(shared, tconn, buf, &request).await;
        }

        let authority = match request.url_host() {
            Ok(a) => a.to_string(),
            Err(e) => {
                let _ = header::write_400(&mut tconn).await;
                return Err(e);
            }
        };

        let need_new = match upstream.as_mut() {
            Some(conn) => conn.addr() != authority || !conn.alive().await,
            None => true,
        };
        if need_new {
            if let Some(old) = upstream.take() {
                shared.http_manager().release(old).await;
            }
            match shared.http_manager().get(&authority).await {
                Ok(conn) => upstream = Some(conn),
                Err(e) => {
                    let _ = header::write_502(&mut tconn).await;
                    return Err(e);
                }
            }
        }
        let conn = match upstream.as_mut() {
            Some(conn) => conn,
            None => unreachable!("upstream populated above"),
        };

        let client_keep_alive = request.keep_alive();

        // request-target and version come off the original start line
        let relative = match request.url_rel() {
            Ok(r) => r.to_string(),
            Err(e) => return Err(e),
        };
        let minor = if request.version() == 1 { 1 } else { 0 };

        strip_hop_by_hop(&mut request);
        request.set("host", "Host", &authority);
        // upstream connections are always persistent; the pool reaps them
        request.set("connection", "Connection", "keep-alive");
        request.remove("proxy-connection");
        request.start_line = format!("{} {} HTTP/1.{}", method, relative, minor);

        debug!(method = %method, authority = %authority, "forward proxy request");

        if let Err(e) = header::write_header(&mut conn.writer, &request).await {
            let _ = header::write_502(&mut tconn).await;
            return Err(e);
        }

        let (t_reader, t_writer) = tconn.halves_mut();
        let (u_reader, u_writer) = conn.halves_mut();

        let request_body = header::pipe_body(t_reader, &mut buf, u_writer, &request);

        let response_side = async {
            let mut rbuf = Buffer::new();
            loop {
                let mut response = match header::parse_header(u_reader, &mut rbuf, false).await? {
                    Some(h) => h,
                    None => {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "upstream closed before response header",
                        )))
                    }
                };
                let remote_keep_alive = response.keep_alive();
                strip_hop_by_hop(&mut response);
                if client_keep_alive {
                    response.set("connection", "Connection", "keep-alive");
                } else {
                    response.set("connection", "Connection", "close");
                }
                header::write_header(t_writer, &response).await?;
                // an interim 100 is followed by the real response header
                if response.status()? != 100 {
                    header::pipe_body(u_reader, &mut rbuf, t_writer, &response).await?;
                    return Ok(remote_keep_alive);
                }
            }
        };

        let (_, remote_keep_alive) = tokio::try_join!(request_body, response_side)?;

        if !remote_keep_alive {
            // upstream said close; session over
            upstream.take();
            return Ok(());
        }
        let conn = match upstream.as_mut() {
            Some(conn) => conn,
            None => unreachable!("kept alive above"),
        };
        if !conn.alive().await {
            return Ok(());
        }
        if !client_keep_alive {
            if let Some(conn) = upstream.take() {
                shared.http_manager().release(conn).await;
            }
            return Ok(());
        }
        // next pipelined request reuses the held upstream
    }
}

async fn handle_connect(
    shared: &ClientShared,
    mut tconn: PlainTransport,
    mut buf: Buffer,
    request: &HttpHeader,
) -> Result<()> {
    let authority = match request.url() {
        Ok(u) => u.to_string(),
        Err(e) => {
            let _ = header::write_400(&mut tconn).await;
            return Err(e);
        }
    };
    let (host, port) = match addr::unpack_addr(&authority) {
        Ok(pair) => pair,
        Err(_) => {
            let _ = header::write_400(&mut tconn).await;
            return Err(Error::InvalidHttpHeader);
        }
    };
    if host.len() > addr::MAX_HOST_LEN {
        let _ = header::write_400(&mut tconn).await;
        return Err(Error::HostTooLong);
    }

    let mut rbuf = Buffer::from_slice(b"HTTP/1.1 200 Connection established\r\n\r\n");
    tconn.write(&mut rbuf).await?;

    // the tunnel's first bytes may already sit behind the header
    let mut prefix = BytesMut::new();
    addr::encode_target(&host, port, &mut prefix)?;
    buf.prepend(&prefix)?;

    tconn.read_with_timeout(&mut buf, PEEK_MILLIS).await?;
    debug!(target = %authority, "connect tunnel established");
    tunnel(shared, tconn, buf, rbuf).await
}

/// Deletes every header named by the `Connection` field (hop-by-hop
/// headers are a single-link contract).
fn strip_hop_by_hop(header: &mut HttpHeader) {
    let Some(tokens) = header.get("connection").map(|t| t.to_string()) else {
        return;
    };
    for token in tokens.split(',') {
        header.remove(&token.trim_matches(' ').to_ascii_lowercase());
    }
}
