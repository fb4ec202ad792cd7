//! SOCKS5-style address encoding shared by the local SOCKS5 codec, the
//! trojan request framing, and the inner UDP packet framing.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use thiserror::Error;

const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("need more bytes")]
    Incomplete,
    #[error("unsupported address type {0:#04x}")]
    BadAtyp(u8),
    #[error("domain name is not valid utf-8")]
    BadDomain,
}

/// A SOCKS5/trojan destination address: IPv4, IPv6, or a domain name, with a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::V4(_, p) | Address::V6(_, p) | Address::Domain(_, p) => *p,
        }
    }

    /// Appends the wire encoding of this address (atyp + body + port) to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Address::V4(ip, port) => {
                out.put_u8(ATYP_V4);
                out.put_slice(&ip.octets());
                out.put_u16(*port);
            }
            Address::V6(ip, port) => {
                out.put_u8(ATYP_V6);
                out.put_slice(&ip.octets());
                out.put_u16(*port);
            }
            Address::Domain(domain, port) => {
                out.put_u8(ATYP_DOMAIN);
                out.put_u8(domain.len() as u8);
                out.put_slice(domain.as_bytes());
                out.put_u16(*port);
            }
        }
    }

    /// Parses one address from the front of `buf`, returning the address and
    /// the number of bytes consumed. Never reports `Malformed` for a short
    /// buffer — only `Incomplete` — so callers parsing from a growing buffer
    /// never mistake a partial read for a protocol violation.
    pub fn decode(buf: &[u8]) -> Result<(Address, usize), AddressError> {
        if buf.is_empty() {
            return Err(AddressError::Incomplete);
        }
        let atyp = buf[0];
        match atyp {
            ATYP_V4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Err(AddressError::Incomplete);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::V4(ip, port), 7))
            }
            ATYP_V6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Err(AddressError::Incomplete);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((Address::V6(Ipv6Addr::from(octets), port), 19))
            }
            ATYP_DOMAIN => {
                if buf.len() < 2 {
                    return Err(AddressError::Incomplete);
                }
                let len = buf[1] as usize;
                let total = 2 + len + 2;
                if buf.len() < total {
                    return Err(AddressError::Incomplete);
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| AddressError::BadDomain)?
                    .to_owned();
                let port = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);
                Ok((Address::Domain(domain, port), total))
            }
            other => Err(AddressError::BadAtyp(other)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::V6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: Address) {
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        let (decoded, consumed) = Address::decode(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn roundtrip_v4() {
        roundtrip(Address::V4(Ipv4Addr::new(127, 0, 0, 1), 80));
    }

    #[test]
    fn roundtrip_v6() {
        roundtrip(Address::V6(Ipv6Addr::LOCALHOST, 443));
    }

    #[test]
    fn roundtrip_domain() {
        roundtrip(Address::Domain("example.com".to_string(), 443));
    }

    #[test]
    fn incremental_safety_never_malformed_on_short_buffer() {
        let mut buf = BytesMut::new();
        Address::Domain("example.com".to_string(), 443).encode(&mut buf);
        for k in 0..buf.len() {
            match Address::decode(&buf[..k]) {
                Err(AddressError::Incomplete) => {}
                other => panic!("expected Incomplete at k={k}, got {other:?}"),
            }
        }
    }

    #[test]
    fn bad_atyp_is_malformed_not_incomplete() {
        let buf = [0x02u8, 0, 0, 0, 0, 0, 0];
        assert_eq!(Address::decode(&buf), Err(AddressError::BadAtyp(0x02)));
    }
}
