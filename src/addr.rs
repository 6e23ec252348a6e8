//! The compact Shadowsocks address form and its textual counterpart.
//!
//! Wire layout: `TYPE(1) | ADDR | PORT(2, big-endian)` with
//! `TYPE` 0x01 = 4-byte IPv4, 0x03 = length-prefixed hostname,
//! 0x04 = 16-byte IPv6. Text form always brackets anything containing a
//! colon, so `[::1]:443` round-trips.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use crate::common::{Error, Result};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Maximum hostname length representable in the length-prefixed form.
pub const MAX_HOST_LEN: usize = 255;

/// Outcome of [`parse_address`] on a partially filled buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedAddr {
    /// The buffer holds fewer than `need` bytes; read more and retry.
    Partial { need: usize },
    /// A complete address occupying the first `consumed` bytes.
    Full { addr: String, consumed: usize },
}

/// Parses the Shadowsocks address at the front of `buf`.
///
/// A short buffer is not an error: `Partial { need }` tells the caller how
/// many bytes a complete address will occupy at minimum.
pub fn parse_address(buf: &[u8]) -> Result<ParsedAddr> {
    if buf.len() < 2 {
        return Ok(ParsedAddr::Partial { need: 2 });
    }
    match buf[0] {
        ATYP_IPV4 => {
            let need = 1 + 4 + 2;
            if buf.len() < need {
                return Ok(ParsedAddr::Partial { need });
            }
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Ok(ParsedAddr::Full {
                addr: format!("[{}]:{}", ip, port),
                consumed: need,
            })
        }
        ATYP_DOMAIN => {
            let host_len = buf[1] as usize;
            let need = 1 + 1 + host_len + 2;
            if buf.len() < need {
                return Ok(ParsedAddr::Partial { need });
            }
            let host_bytes = &buf[2..2 + host_len];
            if host_bytes.contains(&0) {
                return Err(Error::InvalidAddress);
            }
            let host =
                std::str::from_utf8(host_bytes).map_err(|_| Error::InvalidAddress)?;
            let port = u16::from_be_bytes([buf[2 + host_len], buf[3 + host_len]]);
            Ok(ParsedAddr::Full {
                addr: pack_addr(host, port),
                consumed: need,
            })
        }
        ATYP_IPV6 => {
            let need = 1 + 16 + 2;
            if buf.len() < need {
                return Ok(ParsedAddr::Partial { need });
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            Ok(ParsedAddr::Full {
                addr: format!("[{}]:{}", ip, port),
                consumed: need,
            })
        }
        _ => Err(Error::InvalidAddressType),
    }
}

pub fn encode_ipv4(ip: Ipv4Addr, port: u16, out: &mut BytesMut) {
    out.put_u8(ATYP_IPV4);
    out.put_slice(&ip.octets());
    out.put_u16(port);
}

pub fn encode_ipv6(ip: Ipv6Addr, port: u16, out: &mut BytesMut) {
    out.put_u8(ATYP_IPV6);
    out.put_slice(&ip.octets());
    out.put_u16(port);
}

pub fn encode_host(host: &str, port: u16, out: &mut BytesMut) -> Result<()> {
    if host.len() > MAX_HOST_LEN {
        return Err(Error::HostTooLong);
    }
    if host.as_bytes().contains(&0) {
        return Err(Error::InvalidAddress);
    }
    out.put_u8(ATYP_DOMAIN);
    out.put_u8(host.len() as u8);
    out.put_slice(host.as_bytes());
    out.put_u16(port);
    Ok(())
}

/// Encodes `host` with its native address type: IP literals get the
/// compact 0x01/0x04 forms, everything else the hostname form.
pub fn encode_target(host: &str, port: u16, out: &mut BytesMut) -> Result<()> {
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        encode_ipv4(v4, port, out);
        return Ok(());
    }
    if let Ok(v6) = host.parse::<Ipv6Addr>() {
        encode_ipv6(v6, port, out);
        return Ok(());
    }
    encode_host(host, port, out)
}

/// Formats `host:port`, bracketing hosts that contain a colon.
pub fn pack_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Inverse of [`pack_addr`]. Bracketed hosts must look like IPv6
/// (contain a colon); ports must fit in 16 bits.
pub fn unpack_addr(addr: &str) -> Result<(String, u16)> {
    if let Some(pos) = addr.find("]:") {
        if !addr.starts_with('[') {
            return Err(Error::InvalidAddress);
        }
        let host = &addr[1..pos];
        if !host.contains(':') {
            return Err(Error::InvalidAddress);
        }
        let port = parse_port(&addr[pos + 2..])?;
        return Ok((host.to_string(), port));
    }
    match addr.split_once(':') {
        Some((host, port_str)) => Ok((host.to_string(), parse_port(port_str)?)),
        None => Err(Error::InvalidAddress),
    }
}

/// Splits an authority into host and port, defaulting the port when
/// absent. Lenient about brackets (accepts `[1.2.3.4]:80`), so it can
/// consume anything [`parse_address`] produced.
pub fn split_authority(addr: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        match rest.split_once(']') {
            Some((host, "")) => return Ok((host.to_string(), default_port)),
            Some((host, tail)) => {
                let port_str = tail
                    .strip_prefix(':')
                    .ok_or(Error::InvalidAddress)?;
                return Ok((host.to_string(), parse_port(port_str)?));
            }
            None => return Err(Error::InvalidAddress),
        }
    }
    match addr.rsplit_once(':') {
        // more than one colon but no brackets: a bare IPv6 literal
        Some((host, _)) if host.contains(':') => Ok((addr.to_string(), default_port)),
        Some((host, port_str)) => Ok((host.to_string(), parse_port(port_str)?)),
        None => Ok((addr.to_string(), default_port)),
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>().map_err(|_| Error::InvalidAddress)
}
