//! NAT-mode UDP forwarding session (spec.md §4.3): one session per distinct
//! peer `SocketAddr` seen on the shared local UDP socket, each tunneling to
//! a single fixed `target_addr:target_port` through its own outbound TLS
//! connection, garbage-collected after `udp_timeout` seconds of silence in
//! both directions.
//!
//! Grounded on `original_source/src/udpforwardsession.cpp` in full. The
//! original's `gc_timer`/`status` fields (CONNECT → FORWARDING → FORWARD →
//! DESTROY) are folded here into a single `tokio::select!` loop per phase:
//! the reset-on-activity timer falls out of recreating the `sleep` future on
//! every loop iteration rather than explicit `timer.cancel()` calls.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;

use crate::address::Address;
use crate::config::Config;
use crate::trojan;
use crate::udp_packet;

use super::{elapsed_secs, Counters, MAX_LENGTH};

/// A live session's half of the channel the listener feeds datagrams
/// through. Cloneable only in the sense that the listener holds one per
/// peer in its routing table (spec.md §4.3 "demultiplexed by peer").
#[derive(Clone)]
pub struct UdpForwardHandle {
    peer: std::net::SocketAddr,
    sender: mpsc::Sender<Bytes>,
}

impl UdpForwardHandle {
    /// Hands one datagram from `peer` to its session. Returns `false` if the
    /// session has already torn itself down (timeout, remote error) and the
    /// listener should remove it and start a fresh one.
    ///
    /// This is the single shared accept loop's only point of contact with a
    /// per-peer session, so it must never block on a slow session: a
    /// non-blocking `try_send` backed by a bounded channel is this crate's
    /// equivalent of spec.md §4.3 point 3's "buffer up to a soft cap,
    /// dropping and un-accounting further data beyond it" — a session whose
    /// channel is full has a datagram dropped rather than stalling every
    /// other peer's traffic through this loop.
    pub async fn forward(&self, payload: Bytes) -> bool {
        match self.sender.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("[{}] dropped a UDP packet, session is busy", self.peer);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Spawns the session task and returns the handle the listener routes
/// datagrams through. `done` is signalled with `peer` exactly once, after
/// the session's final log line, so the listener can drop its routing
/// table entry (spec.md §4.5 "idempotent destroy" extended to listener
/// bookkeeping: the session itself only ever reports exit once).
pub fn spawn(
    config: Arc<Config>,
    peer: std::net::SocketAddr,
    udp_socket: Arc<UdpSocket>,
    done: mpsc::UnboundedSender<std::net::SocketAddr>,
) -> UdpForwardHandle {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(run(config, peer, udp_socket, rx, done));
    UdpForwardHandle { peer, sender: tx }
}

async fn run(
    config: Arc<Config>,
    peer: std::net::SocketAddr,
    udp_socket: Arc<UdpSocket>,
    rx: mpsc::Receiver<Bytes>,
    done: mpsc::UnboundedSender<std::net::SocketAddr>,
) {
    let start = Instant::now();
    let mut counters = Counters::default();
    let target = target_address(&config);
    log::info!(
        "[{peer}] forwarding UDP packets to {target} via {}:{}",
        config.remote_addr,
        config.remote_port
    );

    if let Err(e) = drive(&config, peer, &udp_socket, rx, &target, &mut counters).await {
        log::debug!("[{peer}] {e}");
    }

    log::info!(
        "[{peer}] disconnected, {} bytes received, {} bytes sent, lasted for {} seconds",
        counters.recv_len,
        counters.sent_len,
        elapsed_secs(start),
    );
    let _ = done.send(peer);
}

async fn drive(
    config: &Config,
    peer: std::net::SocketAddr,
    udp_socket: &UdpSocket,
    mut rx: mpsc::Receiver<Bytes>,
    target: &Address,
    counters: &mut Counters,
) -> io::Result<()> {
    let mut out_write_buf =
        trojan::TrojanRequest::encode_header(config.password_hex(), trojan::Command::UdpAssociate, target);
    let idle_timeout = Duration::from_secs(config.udp_timeout);

    let dial_fut = super::dial_remote(config, peer);
    tokio::pin!(dial_fut);

    // CONNECT: datagrams arriving before the tunnel is up are buffered into
    // the same header-prefixed write, capped at MAX_LENGTH like the
    // original's `out_write_buf` guard.
    let dial_result: io::Result<(TlsStream<TcpStream>, bool)> = loop {
        tokio::select! {
            biased;
            _ = tokio::time::sleep(idle_timeout) => {
                log::info!("[{peer}] UDP session timeout");
                return Ok(());
            }
            res = &mut dial_fut => break res,
            data = rx.recv() => {
                match data {
                    Some(payload) => {
                        if out_write_buf.len() < MAX_LENGTH {
                            counters.sent_len += payload.len() as u64;
                            udp_packet::encode(target, &payload, &mut out_write_buf);
                        } else {
                            log::error!("[{peer}] dropped a UDP packet due to rate limit");
                        }
                    }
                    None => return Ok(()),
                }
            }
        }
    };
    let (mut tls_stream, resumed) = dial_result?;
    log::info!("[{peer}] tunnel established");
    log_resumption(peer, config, resumed);

    tls_stream.write_all(&out_write_buf).await?;

    let (mut tls_read, mut tls_write) = tokio::io::split(tls_stream);
    let mut net_buf = BytesMut::new();
    let mut read_buf = vec![0u8; MAX_LENGTH];

    // FORWARD/FORWARDING: a single select loop drives both directions; the
    // write side is naturally serialized (never reads from `rx` again until
    // the previous write finishes) and the idle timer resets every iteration
    // regardless of which branch fired.
    loop {
        tokio::select! {
            biased;
            _ = tokio::time::sleep(idle_timeout) => {
                log::info!("[{peer}] UDP session timeout");
                return Ok(());
            }
            data = rx.recv() => {
                match data {
                    Some(payload) => {
                        counters.sent_len += payload.len() as u64;
                        log::debug!(
                            "[{peer}] sent a UDP packet of length {} bytes to {target}",
                            payload.len()
                        );
                        let mut framed = BytesMut::new();
                        udp_packet::encode(target, &payload, &mut framed);
                        tls_write.write_all(&framed).await?;
                    }
                    None => return Ok(()),
                }
            }
            res = tls_read.read(&mut read_buf) => {
                let n = res?;
                if n == 0 {
                    return Ok(());
                }
                net_buf.extend_from_slice(&read_buf[..n]);
                let packets = udp_packet::drain_complete(&mut net_buf).map_err(|e| {
                    log::error!("[{peer}] malformed UDP packet from tunnel: {e}");
                    io::Error::new(io::ErrorKind::InvalidData, "malformed UDP packet from tunnel")
                })?;
                if net_buf.len() > MAX_LENGTH {
                    log::error!("[{peer}] UDP packet too long");
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "UDP packet too long"));
                }
                for packet in packets {
                    counters.recv_len += packet.len() as u64;
                    log::debug!(
                        "[{peer}] received a UDP packet of length {} bytes from {}",
                        packet.len(),
                        packet.address
                    );
                    udp_socket.send_to(&packet.payload, peer).await?;
                }
            }
        }
    }
}

fn log_resumption(peer: std::net::SocketAddr, config: &Config, resumed: bool) {
    if config.ssl.reuse_session {
        if resumed {
            log::info!("[{peer}] SSL session reused");
        } else {
            log::info!("[{peer}] SSL session not reused");
        }
    }
}

/// `target_addr`/`target_port` are only read in NAT mode, after
/// `Config::validate_nat_mode` has confirmed both are set.
fn target_address(config: &Config) -> Address {
    let host = config
        .target_addr
        .clone()
        .expect("NAT mode target_addr validated at startup");
    let port = config.target_port.expect("NAT mode target_port validated at startup");
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        Address::V4(ip, port)
    } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
        Address::V6(ip, port)
    } else {
        Address::Domain(host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        // Mirrors config::tests::sample_raw, extended with NAT-mode fields.
        let toml = r#"
            remote_addr = "relay.example.com"
            remote_port = 443
            password = ["hunter2"]
            local_addr = "127.0.0.1:1080"
            target_addr = "10.0.0.5"
            target_port = 53
        "#;
        let path = std::env::temp_dir().join(format!(
            "trojan-client-test-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, toml).unwrap();
        let config = Config::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        config
    }

    #[test]
    fn target_address_prefers_ip_parse_over_domain() {
        let config = base_config();
        match target_address(&config) {
            Address::V4(ip, port) => {
                assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 5));
                assert_eq!(port, 53);
            }
            other => panic!("expected V4, got {other:?}"),
        }
    }

    #[test]
    fn target_address_falls_back_to_domain() {
        let mut config = base_config();
        config.target_addr = Some("example.com".to_string());
        match target_address(&config) {
            Address::Domain(name, port) => {
                assert_eq!(name, "example.com");
                assert_eq!(port, 53);
            }
            other => panic!("expected Domain, got {other:?}"),
        }
    }
}
