//! A TLS-tunneled SOCKS5 circumvention proxy client.
//!
//! Speaks SOCKS5 (RFC 1928) to local applications and relays their TCP
//! CONNECT and UDP ASSOCIATE traffic to a remote server over TLS, framed as
//! `hex(sha224(password)) CRLF cmd addr CRLF payload`. Also supports a
//! NAT-mode front end that forwards raw UDP datagrams to a single fixed
//! remote target without a local SOCKS5 handshake, for use behind `iptables`
//! `REDIRECT`/`TPROXY` rules.
//!
//! ## Modules
//!
//! - [`address`] — the shared SOCKS5-style address encoding
//! - [`socks5`] — the local-facing SOCKS5 wire codec
//! - [`trojan`] — the outbound request framing
//! - [`udp_packet`] — the inner UDP packet framing carried inside the tunnel
//! - [`config`] — TOML configuration loading and validation
//! - [`tls_cache`] — the process-wide TLS session resumption cache
//! - [`session`] — the TCP client and NAT-mode UDP session state machines
//! - [`listener`] — the top-level accept loops

pub mod address;
pub mod config;
pub mod listener;
pub mod session;
pub mod socks5;
pub mod tls_cache;
pub mod trojan;
pub mod udp_packet;
