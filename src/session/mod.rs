//! Shared session state (spec.md §3 "Session base", §4.5 destroy protocol).
//!
//! Both session shapes in this crate — the SOCKS5-speaking TCP client
//! session and the NAT-mode UDP forwarding session — track the same
//! bookkeeping (bytes sent/received, start time) and open their outbound
//! TLS connection the same way. That shared opening sequence lives here;
//! the per-shape state machines live in `tcp` and `udp_forward`.

pub mod tcp;
pub mod udp_forward;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::config::Config;

/// Read/write chunk size, and the cap on `out_write_buf` / `udp_data_buf`
/// growth before a session gives up on an offending peer (spec.md §5
/// "Resource caps"). Matches the upstream trojan client's `MAX_LENGTH`.
pub const MAX_LENGTH: usize = 8192;

/// Byte/duration accounting common to every session (spec.md §3 invariants:
/// `sent_len` is payload bytes that crossed into the tunnel on the user's
/// behalf, `recv_len` is payload bytes delivered back out of it).
#[derive(Debug, Default)]
pub struct Counters {
    pub sent_len: u64,
    pub recv_len: u64,
}

pub fn elapsed_secs(start: Instant) -> u64 {
    start.elapsed().as_secs()
}

/// Applies `tcp.no_delay` / `tcp.keep_alive` / `tcp.fast_open` to a freshly
/// created outbound socket and connects it, mirroring
/// `ClientSession::in_sent`'s `REQUEST` arm / `UDPForwardSession::start` in
/// `original_source/src/{clientsession,udpforwardsession}.cpp`: open, set
/// options, connect — all before the TLS handshake begins. The socket is
/// built with `socket2` (pre-connect options aren't reachable through
/// `tokio::net::TcpStream::connect` alone) and handed to tokio once the
/// connect is in flight.
pub async fn connect_outbound(config: &Config, target: SocketAddr) -> io::Result<TcpStream> {
    let domain = if target.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
    socket.set_nonblocking(true)?;

    if config.tcp.no_delay {
        socket.set_nodelay(true)?;
    }
    if config.tcp.keep_alive {
        let keepalive = socket2::TcpKeepalive::new();
        socket.set_tcp_keepalive(&keepalive)?;
    }
    if config.tcp.fast_open {
        // Best-effort: TCP_FASTOPEN_CONNECT is Linux-only and may not be
        // supported by the running kernel; an unsupported platform or an
        // old kernel silently falls back to a normal connect (spec.md §6).
        #[cfg(target_os = "linux")]
        let _ = socket.set_tcp_fastopen_connect(true);
    }

    match socket.connect(&target.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == io::ErrorKind::InProgress => {}
        Err(e) => return Err(e),
    }

    let stream = TcpStream::from_std(socket.into())?;
    stream.writable().await?;
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    Ok(stream)
}

/// Resolves `remote_addr:remote_port`, connects, and performs the outbound
/// TLS handshake, applying SNI and session-cache resumption per spec.md
/// §4.2 step 5/§4.4. Returns the established stream and whether the
/// handshake resumed a cached session (used only for the log line).
///
/// `peer` is only used for logging: spec.md §4.2 edge cases requires an
/// error-level log naming the remote endpoint for each of resolve, connect,
/// and TLS handshake failure, mirroring `original_source/src/clientsession.cpp`'s
/// `Log::ERROR` calls at exactly these three sites (lines 227, 252, 258).
pub async fn dial_remote(config: &Config, peer: SocketAddr) -> io::Result<(TlsStream<TcpStream>, bool)> {
    let mut addrs = tokio::net::lookup_host((config.remote_addr.as_str(), config.remote_port))
        .await
        .map_err(|e| {
            let msg = format!("cannot resolve remote server hostname {}: {e}", config.remote_addr);
            log::error!("[{peer}] {msg}");
            io::Error::new(e.kind(), msg)
        })?;
    let target = addrs.next().ok_or_else(|| {
        let msg = format!("no addresses found for {}", config.remote_addr);
        log::error!("[{peer}] {msg}");
        io::Error::new(io::ErrorKind::NotFound, msg)
    })?;

    let tcp_stream = connect_outbound(config, target).await.map_err(|e| {
        let msg = format!(
            "cannot establish connection to remote server {}:{}: {e}",
            config.remote_addr, config.remote_port
        );
        log::error!("[{peer}] {msg}");
        io::Error::new(e.kind(), msg)
    })?;

    let tls_config = crate::tls_cache::client_config(config.ssl.reuse_session);
    let connector = TlsConnector::from(tls_config);

    let sni = if config.ssl.sni.is_empty() {
        config.remote_addr.as_str()
    } else {
        config.ssl.sni.as_str()
    };
    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid SNI hostname"))?;

    let tls_stream = connector.connect(server_name, tcp_stream).await.map_err(|e| {
        let msg = format!(
            "SSL handshake failed with {}:{}: {e}",
            config.remote_addr, config.remote_port
        );
        log::error!("[{peer}] {msg}");
        io::Error::new(e.kind(), msg)
    })?;

    let resumed = matches!(
        tls_stream.get_ref().1.handshake_kind(),
        Some(tokio_rustls::rustls::HandshakeKind::Resumed)
    );
    Ok((tls_stream, resumed))
}

pub type SharedConfig = Arc<Config>;
