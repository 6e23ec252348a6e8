//! SOCKS4/4a and SOCKS5 handshakes.
//!
//! Both handlers end the same way: the connection buffer is rewritten in
//! place into the Shadowsocks wire address, the protocol reply goes out,
//! and after a short peek for eagerly sent payload the generic tunnel path
//! takes over.

use tracing::debug;

use super::{read_more, tunnel, ClientShared, PEEK_MILLIS};
use crate::addr::{ATYP_DOMAIN, ATYP_IPV4};
use crate::common::{Buffer, Error, Result};
use crate::net::{PlainTransport, WriteTransport};

/// CONNECT is the only supported command in either dialect.
const CMD_CONNECT: u8 = 0x01;

pub(crate) async fn handle_socks5(
    shared: &ClientShared,
    mut tconn: PlainTransport,
    mut buf: Buffer,
) -> Result<()> {
    let nmethods = buf.as_slice()[1] as usize;
    let no_auth_offered = buf.as_slice()[2..2 + nmethods].contains(&0x00);

    let mut rbuf = Buffer::new();
    if !no_auth_offered {
        rbuf.append(&[0x05, 0xFF])?;
        let _ = tconn.write(&mut rbuf).await;
        return Err(Error::NoValidAuth);
    }
    rbuf.append(&[0x05, 0x00])?;
    tconn.write(&mut rbuf).await?;

    // request: VER CMD RSV ATYP ADDR... PORT
    buf.consume(2 + nmethods);
    while buf.len() < 7 {
        read_more(&mut tconn, &mut buf).await?;
    }
    if buf.as_slice()[1] != CMD_CONNECT {
        return Err(Error::CommandNotSupported("socks5"));
    }
    let addr_len = match buf.as_slice()[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => 1 + buf.as_slice()[4] as usize,
        _ => return Err(Error::InvalidProtocol("socks5")),
    };
    while buf.len() < 4 + addr_len + 2 {
        read_more(&mut tconn, &mut buf).await?;
    }
    // dropping VER/CMD/RSV leaves exactly the Shadowsocks address form
    buf.consume(3);

    // no server bound address to report
    rbuf.append(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])?;
    tconn.write(&mut rbuf).await?;

    tconn.read_with_timeout(&mut buf, PEEK_MILLIS).await?;
    debug!("socks5 tunnel established");
    tunnel(shared, tconn, buf, rbuf).await
}

pub(crate) async fn handle_socks4(
    shared: &ClientShared,
    mut tconn: PlainTransport,
    mut buf: Buffer,
) -> Result<()> {
    if buf.as_slice()[1] != CMD_CONNECT {
        return Err(Error::CommandNotSupported("socks4"));
    }
    let port = u16::from_be_bytes([buf.as_slice()[2], buf.as_slice()[3]]);

    // 0.0.0.x with x != 0 marks a SOCKS4a request carrying a hostname
    let ip = &buf.as_slice()[4..8];
    let is_socks4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;

    if is_socks4a {
        // userid and hostname are both NUL-terminated
        let mut first_nul = 0usize;
        let second_nul;
        let mut i = 8;
        loop {
            while i >= buf.len() {
                read_more(&mut tconn, &mut buf).await?;
            }
            if buf.as_slice()[i] == 0 {
                if first_nul == 0 {
                    first_nul = i;
                } else {
                    second_nul = i;
                    break;
                }
            }
            i += 1;
        }
        let host_len = second_nul - first_nul - 1;
        if host_len > 255 {
            return Err(Error::InvalidProtocol("socks4"));
        }
        let bytes = buf.as_mut_slice();
        bytes.copy_within(first_nul + 1..second_nul, 2);
        bytes[0] = ATYP_DOMAIN;
        bytes[1] = host_len as u8;
        buf.truncate(2 + host_len);
        buf.append(&port.to_be_bytes())?;
    } else {
        // plain SOCKS4: skip the userid, keep the literal IPv4
        let mut i = 8;
        loop {
            while i >= buf.len() {
                read_more(&mut tconn, &mut buf).await?;
            }
            if buf.as_slice()[i] == 0 {
                break;
            }
            i += 1;
        }
        let bytes = buf.as_mut_slice();
        bytes.copy_within(4..8, 1);
        bytes[0] = ATYP_IPV4;
        buf.truncate(5);
        buf.append(&port.to_be_bytes())?;
    }

    let mut rbuf = Buffer::new();
    rbuf.append(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0])?;
    tconn.write(&mut rbuf).await?;

    tconn.read_with_timeout(&mut buf, PEEK_MILLIS).await?;
    debug!(socks4a = is_socks4a, "socks4 tunnel established");
    tunnel(shared, tconn, buf, rbuf).await
}
