//! Linux transparent-redirect support (iptables REDIRECT).
//!
//! A redirected socket still knows where the application really wanted to
//! go: netfilter stores the pre-rewrite destination, readable with
//! `getsockopt(SO_ORIGINAL_DST)` at SOL_IP (or SOL_IPV6 for v6 rules).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tracing::debug;

use super::{tunnel, ClientShared, PEEK_MILLIS};
use crate::addr;
use crate::common::{Buffer, Result};
use crate::net::PlainTransport;

const SO_ORIGINAL_DST: libc::c_int = 80;

/// Reads the original destination off a redirected socket, trying IPv4
/// then IPv6.
pub fn original_dst(stream: &TcpStream) -> Option<SocketAddr> {
    let fd = stream.as_raw_fd();

    let mut v4: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut v4_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            (&mut v4 as *mut libc::sockaddr_in).cast(),
            &mut v4_len,
        )
    };
    if ret == 0 {
        let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
        return Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(v4.sin_port)));
    }

    let mut v6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    let mut v6_len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            SO_ORIGINAL_DST,
            (&mut v6 as *mut libc::sockaddr_in6).cast(),
            &mut v6_len,
        )
    };
    if ret == 0 {
        let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
        return Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(v6.sin6_port)));
    }

    None
}

/// A socket counts as redirected when its recorded original destination
/// differs from the address we are actually listening on.
pub fn detect_redir(stream: &TcpStream) -> Option<SocketAddr> {
    let original = original_dst(stream)?;
    match stream.local_addr() {
        Ok(local) if local == original => None,
        Ok(_) => Some(original),
        Err(_) => None,
    }
}

pub(crate) async fn handle_redir(
    shared: &ClientShared,
    mut tconn: PlainTransport,
    mut buf: Buffer,
    original: SocketAddr,
) -> Result<()> {
    let mut prefix = BytesMut::new();
    match original {
        SocketAddr::V4(a) => addr::encode_ipv4(*a.ip(), a.port(), &mut prefix),
        SocketAddr::V6(a) => addr::encode_ipv6(*a.ip(), a.port(), &mut prefix),
    }
    buf.append(&prefix)?;

    tconn.read_with_timeout(&mut buf, PEEK_MILLIS).await?;
    debug!(target = %original, "transparent redirect tunnel");
    tunnel(shared, tconn, buf, Buffer::new()).await
}
