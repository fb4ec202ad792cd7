//! Local-side SOCKS5 wire codec (RFC 1928): greeting, request, and their
//! replies. Pure functions over byte buffers — no I/O here, see
//! `session::tcp` for the state machine that drives these.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::address::{Address, AddressError};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded,
    CommandNotSupported,
}

impl ReplyCode {
    fn byte(self) -> u8 {
        match self {
            ReplyCode::Succeeded => 0x00,
            ReplyCode::CommandNotSupported => 0x07,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GreetingError {
    #[error("not a SOCKS5 greeting")]
    NotSocks5,
    #[error("greeting length does not match NMETHODS")]
    LengthMismatch,
}

/// Outcome of validating a client greeting: either accepted (reply `05 00`
/// should be sent and the session proceeds to REQUEST), or rejected with no
/// usable auth method (reply `05 FF` should be sent and the session must
/// then destroy on write completion — spec.md's INVALID state).
#[derive(Debug, PartialEq, Eq)]
pub enum GreetingOutcome {
    Accepted,
    NoAcceptableMethod,
}

/// Validates `05 NMETHODS METHODS...` against the full buffer. Per spec.md
/// §9's first Open Question, this is a bug-compatible single-chunk check:
/// `buf.len() == buf[1] + 2` exactly, not an incremental parse. Any
/// structural mismatch (wrong version, length mismatch) returns an error and
/// the caller destroys the session without replying.
pub fn parse_greeting(buf: &[u8]) -> Result<GreetingOutcome, GreetingError> {
    if buf.len() < 2 || buf[0] != VERSION {
        return Err(GreetingError::NotSocks5);
    }
    let nmethods = buf[1] as usize;
    if buf.len() != nmethods + 2 {
        return Err(GreetingError::LengthMismatch);
    }
    if buf[2..].contains(&METHOD_NO_AUTH) {
        Ok(GreetingOutcome::Accepted)
    } else {
        Ok(GreetingOutcome::NoAcceptableMethod)
    }
}

pub fn greeting_reply(outcome: GreetingOutcome) -> [u8; 2] {
    match outcome {
        GreetingOutcome::Accepted => [VERSION, METHOD_NO_AUTH],
        GreetingOutcome::NoAcceptableMethod => [VERSION, METHOD_NO_ACCEPTABLE],
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("bad request")]
    BadRequest,
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error(transparent)]
    Address(#[from] AddressError),
}

pub struct ParsedRequest {
    pub command: Command,
    pub address: Address,
}

/// Parses `05 cmd 00 atyp addr port` from `buf`. Returns
/// `RequestError::UnsupportedCommand` for any `cmd` other than CONNECT/UDP
/// ASSOCIATE (caller replies `command_not_supported_reply()` and enters
/// INVALID); any other structural mismatch is `BadRequest` (caller destroys
/// without reply), matching spec.md §4.1.
pub fn parse_request(buf: &[u8]) -> Result<ParsedRequest, RequestError> {
    if buf.len() < 7 || buf[0] != VERSION || buf[2] != 0x00 {
        return Err(RequestError::BadRequest);
    }
    let cmd = buf[1];
    let command = match cmd {
        0x01 => Command::Connect,
        0x03 => Command::UdpAssociate,
        _ => return Err(RequestError::UnsupportedCommand(cmd)),
    };
    let (address, _) = Address::decode(&buf[3..])?;
    Ok(ParsedRequest { command, address })
}

/// `05 00 00 01 00 00 00 00 00 00` — stock CONNECT success reply (bind
/// address is not meaningful for this client, mirrors the original).
pub fn connect_success_reply() -> [u8; 10] {
    [VERSION, ReplyCode::Succeeded.byte(), 0x00, 0x01, 0, 0, 0, 0, 0, 0]
}

/// `05 07 00 01 00 00 00 00 00 00` — command-not-supported reply.
pub fn command_not_supported_reply() -> [u8; 10] {
    [
        VERSION,
        ReplyCode::CommandNotSupported.byte(),
        0x00,
        0x01,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

/// `05 00 00 <addr>` — UDP ASSOCIATE success reply advertising the bound
/// relay address the client should send its UDP datagrams to.
pub fn udp_associate_reply(bound: &Address) -> BytesMut {
    let mut out = BytesMut::with_capacity(3 + 19);
    out.put_u8(VERSION);
    out.put_u8(ReplyCode::Succeeded.byte());
    out.put_u8(0x00);
    bound.encode(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn greeting_accepts_no_auth() {
        let buf = [0x05, 0x01, 0x00];
        assert_eq!(parse_greeting(&buf), Ok(GreetingOutcome::Accepted));
    }

    #[test]
    fn greeting_rejects_gssapi_only() {
        let buf = [0x05, 0x01, 0x01];
        assert_eq!(
            parse_greeting(&buf),
            Ok(GreetingOutcome::NoAcceptableMethod)
        );
    }

    #[test]
    fn greeting_rejects_length_mismatch() {
        // claims two methods, provides one
        let buf = [0x05, 0x02, 0x00];
        assert_eq!(parse_greeting(&buf), Err(GreetingError::LengthMismatch));
    }

    #[test]
    fn greeting_rejects_bad_version() {
        let buf = [0x04, 0x01, 0x00];
        assert_eq!(parse_greeting(&buf), Err(GreetingError::NotSocks5));
    }

    #[test]
    fn request_connect_happy_path() {
        let buf = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        let req = parse_request(&buf).unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.address, Address::V4(Ipv4Addr::new(127, 0, 0, 1), 80));
    }

    #[test]
    fn request_unsupported_command() {
        let buf = [0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            parse_request(&buf),
            Err(RequestError::UnsupportedCommand(0x02))
        );
    }

    #[test]
    fn request_bad_reserved_byte() {
        let buf = [0x05, 0x01, 0x01, 0x01, 0, 0, 0, 0, 0, 0];
        assert_eq!(parse_request(&buf), Err(RequestError::BadRequest));
    }
}
