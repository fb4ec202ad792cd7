//! The SOCKS5-speaking TCP client session (spec.md §4.2): the state
//! machine driving one accepted local TCP connection through HANDSHAKE,
//! REQUEST, CONNECT, and either FORWARD or UDP_FORWARD.
//!
//! Grounded on `original_source/src/clientsession.cpp` in full. That file
//! expresses the algorithm as a chain of callbacks sharing `this` through
//! `shared_from_this()`; here the same ordering (SOCKS5 reply write →
//! resolver → connect → TLS handshake → optional cancel of the racing
//! first-payload read → begin forwarding) is expressed directly as
//! sequential `async`/`await` code with `tokio::select!` at the points
//! where the original races two callbacks against each other — spec.md §9
//! explicitly allows this restatement provided the ordering holds.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;

use crate::address::Address;
use crate::config::Config;
use crate::socks5;
use crate::trojan;
use crate::udp_packet;

use super::{elapsed_secs, Counters, MAX_LENGTH};

/// Drives one accepted local connection end to end, logging its final
/// accounting line exactly once regardless of which branch ended it
/// (spec.md §4.5/§8 "idempotent destroy" — here there is only ever one
/// exit path, so idempotency falls out of normal control flow rather than
/// needing an explicit guard).
pub struct TcpClientSession {
    config: Arc<Config>,
}

impl TcpClientSession {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub async fn serve(self, in_stream: TcpStream) {
        let peer = match in_stream.peer_addr() {
            Ok(p) => p,
            Err(e) => {
                log::debug!("failed to read peer address, dropping connection: {e}");
                return;
            }
        };
        let start = Instant::now();
        let mut counters = Counters::default();

        if let Err(e) = self.drive(in_stream, peer, &mut counters).await {
            log::debug!("[{peer}] {e}");
        }

        log::info!(
            "[{peer}] disconnected, {} bytes received, {} bytes sent, lasted for {} seconds",
            counters.recv_len,
            counters.sent_len,
            elapsed_secs(start),
        );
    }

    async fn drive(
        &self,
        mut in_stream: TcpStream,
        peer: SocketAddr,
        counters: &mut Counters,
    ) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_LENGTH];

        // HANDSHAKE: a single read, matching the bug-compatible single-chunk
        // greeting check spec.md §9 calls out — no accumulation across reads.
        let n = in_stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        match socks5::parse_greeting(&buf[..n]) {
            Ok(socks5::GreetingOutcome::Accepted) => {
                in_stream
                    .write_all(&socks5::greeting_reply(socks5::GreetingOutcome::Accepted))
                    .await?;
            }
            Ok(socks5::GreetingOutcome::NoAcceptableMethod) => {
                log::error!("[{peer}] unsupported auth method");
                in_stream
                    .write_all(&socks5::greeting_reply(
                        socks5::GreetingOutcome::NoAcceptableMethod,
                    ))
                    .await?;
                // INVALID: the write above is this session's last action.
                return Ok(());
            }
            Err(e) => {
                log::error!("[{peer}] unknown protocol: {e}");
                return Ok(());
            }
        }

        // REQUEST
        let n = in_stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let parsed = match socks5::parse_request(&buf[..n]) {
            Ok(p) => p,
            Err(socks5::RequestError::UnsupportedCommand(cmd)) => {
                log::error!("[{peer}] unsupported command {cmd:#04x}");
                in_stream
                    .write_all(&socks5::command_not_supported_reply())
                    .await?;
                return Ok(());
            }
            Err(e) => {
                log::error!("[{peer}] bad request: {e}");
                return Ok(());
            }
        };

        let trojan_command = match parsed.command {
            socks5::Command::Connect => trojan::Command::Connect,
            socks5::Command::UdpAssociate => trojan::Command::UdpAssociate,
        };
        let header =
            trojan::TrojanRequest::encode_header(self.config.password_hex(), trojan_command, &parsed.address);

        match parsed.command {
            socks5::Command::Connect => {
                log::info!("[{peer}] requested connection to {}", parsed.address);
                in_stream.write_all(&socks5::connect_success_reply()).await?;
                self.run_tcp_forward(in_stream, peer, header, counters).await
            }
            socks5::Command::UdpAssociate => {
                let local_ip = in_stream.local_addr()?.ip();
                let udp_socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
                let bound = udp_socket.local_addr()?;
                log::info!(
                    "[{peer}] requested UDP associate to {}, open UDP socket {bound} for relay",
                    parsed.address
                );
                in_stream
                    .write_all(&socks5::udp_associate_reply(&socket_addr_to_address(bound)))
                    .await?;
                self.run_udp_forward(in_stream, udp_socket, peer, header, counters)
                    .await
            }
        }
    }

    /// CONNECT flow: spec.md §4.2 steps 4-7.
    async fn run_tcp_forward(
        &self,
        mut in_stream: TcpStream,
        peer: SocketAddr,
        mut out_write_buf: BytesMut,
        counters: &mut Counters,
    ) -> io::Result<()> {
        let mut first_packet_recv = !self.config.append_payload;
        let mut payload_buf = vec![0u8; MAX_LENGTH];

        let dial_fut = super::dial_remote(&self.config, peer);
        tokio::pin!(dial_fut);

        let dial_result: io::Result<(TlsStream<TcpStream>, bool)> = loop {
            tokio::select! {
                biased;
                res = &mut dial_fut => break res,
                res = in_stream.read(&mut payload_buf), if !first_packet_recv => {
                    first_packet_recv = true;
                    match res {
                        Ok(n) if n > 0 => {
                            counters.sent_len += n as u64;
                            out_write_buf.extend_from_slice(&payload_buf[..n]);
                        }
                        Ok(_) => {}
                        Err(e) => break Err(e),
                    }
                }
            }
        };
        let (mut tls_stream, resumed) = dial_result?;
        log::info!("[{peer}] tunnel established");
        log_resumption(peer, &self.config, resumed);

        tls_stream.write_all(&out_write_buf).await?;
        forward_bidirectional(in_stream, tls_stream, counters, peer).await
    }

    /// UDP ASSOCIATE flow: spec.md §4.2 steps 4-8.
    async fn run_udp_forward(
        &self,
        mut in_stream: TcpStream,
        udp_socket: UdpSocket,
        peer: SocketAddr,
        mut out_write_buf: BytesMut,
        counters: &mut Counters,
    ) -> io::Result<()> {
        let mut first_packet_recv = !self.config.append_payload;
        let mut udp_recv_endpoint: Option<SocketAddr> = None;
        let mut udp_buf = vec![0u8; MAX_LENGTH];
        let mut watch_buf = [0u8; 1];

        let dial_fut = super::dial_remote(&self.config, peer);
        tokio::pin!(dial_fut);

        // The TCP control connection must stay silent for the rest of this
        // session's lifetime once UDP associate has been requested; any byte
        // (or EOF) arriving on it is unexpected (spec.md §4.2 edge cases).
        let dial_result: io::Result<(TlsStream<TcpStream>, bool)> = loop {
            tokio::select! {
                biased;
                res = in_stream.read(&mut watch_buf) => {
                    res?;
                    return Err(unexpected_tcp_data());
                }
                res = &mut dial_fut => break res,
                res = udp_socket.recv_from(&mut udp_buf), if !first_packet_recv => {
                    first_packet_recv = true;
                    match res {
                        Ok((n, from)) => {
                            udp_recv_endpoint = Some(from);
                            match validate_client_datagram(&udp_buf[..n]) {
                                Ok((address, offset)) => {
                                    let payload = &udp_buf[offset..n];
                                    counters.sent_len += payload.len() as u64;
                                    udp_packet::encode(&address, payload, &mut out_write_buf);
                                }
                                Err(e) => {
                                    log::error!("[{peer}] bad UDP packet");
                                    break Err(e);
                                }
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };
        let (mut tls_stream, resumed) = dial_result?;
        log::info!("[{peer}] tunnel established");
        log_resumption(peer, &self.config, resumed);

        tls_stream.write_all(&out_write_buf).await?;

        let (mut tls_read, mut tls_write) = tokio::io::split(tls_stream);
        let endpoint = Arc::new(Mutex::new(udp_recv_endpoint));
        let endpoint_writer = Arc::clone(&endpoint);
        let sent_len = &mut counters.sent_len;
        let recv_len = &mut counters.recv_len;

        let watcher = async {
            let mut buf = [0u8; 1];
            match in_stream.read(&mut buf).await {
                Ok(_) => Err(unexpected_tcp_data()),
                Err(e) => Err(e),
            }
        };

        let udp_to_tls = async {
            let mut buf = vec![0u8; MAX_LENGTH];
            loop {
                let (n, from) = udp_socket.recv_from(&mut buf).await?;
                *endpoint_writer.lock().unwrap() = Some(from);
                let (address, offset) = validate_client_datagram(&buf[..n]).map_err(|e| {
                    log::error!("[{peer}] bad UDP packet");
                    e
                })?;
                let payload = &buf[offset..n];
                *sent_len += payload.len() as u64;
                log::debug!(
                    "[{peer}] sent a UDP packet of length {} bytes to {address}",
                    payload.len()
                );
                let mut framed = BytesMut::new();
                udp_packet::encode(&address, payload, &mut framed);
                tls_write.write_all(&framed).await?;
            }
            #[allow(unreachable_code)]
            Ok::<(), io::Error>(())
        };

        let tls_to_udp = async {
            let mut net_buf = BytesMut::new();
            let mut read_buf = vec![0u8; MAX_LENGTH];
            loop {
                let n = tls_read.read(&mut read_buf).await?;
                if n == 0 {
                    return Ok::<(), io::Error>(());
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
                    *recv_len += packet.len() as u64;
                    log::debug!(
                        "[{peer}] received a UDP packet of length {} bytes from {}",
                        packet.len(),
                        packet.address
                    );
                    let dest = *endpoint.lock().unwrap();
                    if let Some(dest) = dest {
                        let mut reply = BytesMut::with_capacity(3 + packet.payload.len() + 20);
                        reply.put_slice(&[0, 0, 0]);
                        packet.address.encode(&mut reply);
                        reply.put_slice(&packet.payload);
                        udp_socket.send_to(&reply, dest).await?;
                    }
                }
            }
        };

        tokio::select! {
            r = watcher => r,
            r = udp_to_tls => r,
            r = tls_to_udp => r,
        }
    }
}

fn unexpected_tcp_data() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "unexpected data from TCP port")
}

fn log_resumption(peer: SocketAddr, config: &Config, resumed: bool) {
    if config.ssl.reuse_session {
        if resumed {
            log::info!("[{peer}] SSL session reused");
        } else {
            log::info!("[{peer}] SSL session not reused");
        }
    }
}

fn socket_addr_to_address(addr: SocketAddr) -> Address {
    match addr {
        SocketAddr::V4(v4) => Address::V4(*v4.ip(), v4.port()),
        SocketAddr::V6(v6) => Address::V6(*v6.ip(), v6.port()),
    }
}

/// Validates the SOCKS5 UDP request header the local peer prepends to every
/// datagram it sends us (`rsv:2 frag:1 addr ...`), returning the decoded
/// destination address and the offset of the payload that follows it.
/// Any non-zero `rsv`/`frag` byte is a bad packet (spec.md §4.2 edge cases).
fn validate_client_datagram(data: &[u8]) -> Result<(Address, usize), io::Error> {
    if data.len() < 3 || data[0] != 0 || data[1] != 0 || data[2] != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad UDP packet"));
    }
    let (address, addr_len) = Address::decode(&data[3..])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad UDP packet"))?;
    Ok((address, 3 + addr_len))
}

/// FORWARD state: two independent ping-pong loops (spec.md §5) — each reads
/// from one side and is not re-armed until the corresponding write to the
/// other side completes. Racing them with `select!` means either side
/// closing or failing ends the whole relay.
async fn forward_bidirectional(
    in_stream: TcpStream,
    tls_stream: TlsStream<TcpStream>,
    counters: &mut Counters,
    peer: SocketAddr,
) -> io::Result<()> {
    let (mut in_read, mut in_write) = tokio::io::split(in_stream);
    let (mut tls_read, mut tls_write) = tokio::io::split(tls_stream);
    let sent_len = &mut counters.sent_len;
    let recv_len = &mut counters.recv_len;

    let local_to_remote = async {
        let mut buf = vec![0u8; MAX_LENGTH];
        loop {
            let n = in_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
            *sent_len += n as u64;
            tls_write.write_all(&buf[..n]).await?;
        }
    };
    let remote_to_local = async {
        let mut buf = vec![0u8; MAX_LENGTH];
        loop {
            let n = tls_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
            *recv_len += n as u64;
            in_write.write_all(&buf[..n]).await?;
        }
    };

    let result = tokio::select! {
        r = local_to_remote => r,
        r = remote_to_local => r,
    };
    let _ = tls_write.shutdown().await;
    let _ = in_write.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn validates_good_client_datagram() {
        let mut data = vec![0u8, 0, 0];
        let addr = Address::V4(Ipv4Addr::new(8, 8, 8, 8), 53);
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        data.extend_from_slice(&buf);
        data.extend_from_slice(b"hello");

        let (decoded, offset) = validate_client_datagram(&data).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(&data[offset..], b"hello");
    }

    #[test]
    fn rejects_nonzero_frag_byte() {
        let data = [0u8, 0, 1, 1, 8, 8, 8, 8, 0, 53];
        assert!(validate_client_datagram(&data).is_err());
    }

    #[test]
    fn socket_addr_conversion_round_trips_v4() {
        let sa: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        match socket_addr_to_address(sa) {
            Address::V4(ip, port) => {
                assert_eq!(ip, Ipv4Addr::new(127, 0, 0, 1));
                assert_eq!(port, 1080);
            }
            other => panic!("expected V4, got {other:?}"),
        }
    }
}
