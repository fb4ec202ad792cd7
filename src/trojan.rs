//! The "trojan request" framing sent as the first bytes of every outbound
//! TLS connection: `hex(password) CRLF cmd addr CRLF payload...`.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::address::{Address, AddressError};

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    UdpAssociate = 0x03,
}

impl Command {
    fn byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanRequest {
    pub command: Command,
    pub address: Address,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrojanError {
    #[error("need more bytes")]
    Incomplete,
    #[error("malformed trojan request")]
    Malformed,
}

impl From<AddressError> for TrojanError {
    fn from(e: AddressError) -> Self {
        match e {
            AddressError::Incomplete => TrojanError::Incomplete,
            _ => TrojanError::Malformed,
        }
    }
}

impl TrojanRequest {
    /// Builds the framing header — `hex(password) CRLF cmd addr CRLF` — to
    /// be followed by the caller's payload bytes. `password_hex` is the
    /// first configured password's hex digest (see `Config::passwords`).
    pub fn encode_header(password_hex: &str, command: Command, address: &Address) -> BytesMut {
        let mut out = BytesMut::with_capacity(password_hex.len() + 2 + 1 + 32 + 2);
        out.put_slice(password_hex.as_bytes());
        out.put_slice(CRLF);
        out.put_u8(command.byte());
        address.encode(&mut out);
        out.put_slice(CRLF);
        out
    }

    /// Parses `hex(password) CRLF cmd addr CRLF` from the front of `buf`,
    /// returning the request, the hex password seen, and the number of
    /// bytes consumed (trailing payload bytes, if any, are left in place —
    /// spec.md §4.1 notes parsing must tolerate that user payload follows).
    pub fn decode(buf: &[u8]) -> Result<(TrojanRequest, String, usize), TrojanError> {
        let sep = find_crlf(buf).ok_or(TrojanError::Incomplete)?;
        let password_hex = std::str::from_utf8(&buf[..sep])
            .map_err(|_| TrojanError::Malformed)?
            .to_owned();
        let rest = &buf[sep + 2..];
        if rest.is_empty() {
            return Err(TrojanError::Incomplete);
        }
        let cmd_byte = rest[0];
        let command = match cmd_byte {
            0x01 => Command::Connect,
            0x03 => Command::UdpAssociate,
            _ => return Err(TrojanError::Malformed),
        };
        let (address, addr_len) = Address::decode(&rest[1..])?;
        let after_addr = 1 + addr_len;
        if rest.len() < after_addr + 2 {
            return Err(TrojanError::Incomplete);
        }
        if &rest[after_addr..after_addr + 2] != CRLF {
            return Err(TrojanError::Malformed);
        }
        let consumed = sep + 2 + after_addr + 2;
        Ok((TrojanRequest { command, address }, password_hex, consumed))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}
