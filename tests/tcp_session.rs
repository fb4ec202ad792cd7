//! End-to-end tests for `TcpClientSession` against real loopback sockets, the
//! same style as `examples/0xinf0-nooshdaroo/tests/test_handshake_flow.rs`:
//! the SOCKS5 front-door scenarios from spec.md §8 that terminate before the
//! outbound connect is ever attempted (unsupported auth method, bad greeting
//! length), plus the TLS-handshake-failure scenario, which needs nothing
//! more than a loopback listener standing in as the remote relay and closing
//! before any TLS bytes are exchanged.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use trojan_client::config::Config;
use trojan_client::session::tcp::TcpClientSession;

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn write_temp_config(remote_addr: &str, remote_port: u16) -> PathBuf {
    let toml = format!(
        r#"
        remote_addr = "{remote_addr}"
        remote_port = {remote_port}
        password = ["hunter2"]
        local_addr = "127.0.0.1:0"
    "#
    );
    let path = std::env::temp_dir().join(format!(
        "trojan-client-tcp-session-test-{}-{}.toml",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
    ));
    std::fs::write(&path, toml).unwrap();
    path
}

async fn spawn_session_with_remote(remote: SocketAddr) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let path = write_temp_config(&remote.ip().to_string(), remote.port());
    let config = Arc::new(Config::load(&path).unwrap());
    let _ = std::fs::remove_file(&path);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        TcpClientSession::new(config).serve(stream).await;
    });

    (addr, handle)
}

/// A remote endpoint good enough for tests that never actually dial it
/// (both pre-TLS-connect SOCKS5 front-door scenarios below).
fn unreachable_remote() -> SocketAddr {
    "127.0.0.1:1".parse().unwrap()
}

async fn spawn_session() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    spawn_session_with_remote(unreachable_remote()).await
}

/// spec.md §8 scenario 2: "Local sends `05 01 02` (gssapi only). Expect:
/// local receives `05 FF`; session terminates after the reply write."
#[tokio::test]
async fn unsupported_auth_method_replies_then_closes() {
    let (addr, server) = spawn_session().await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x01]).await.unwrap();

    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xff]);

    // INVALID: no further bytes, connection closes on the reply write.
    let mut trailing = [0u8; 1];
    let n = client.read(&mut trailing).await.unwrap();
    assert_eq!(n, 0);

    server.await.unwrap();
}

/// spec.md §8 scenario 3: "Local sends `05 02 00` (claims two methods,
/// provides one). Expect: session destroyed without reply."
#[tokio::test]
async fn bad_greeting_length_destroys_without_reply() {
    let (addr, server) = spawn_session().await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(&[0x05, 0x02, 0x00]).await.unwrap();

    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "session must not reply on a structurally invalid greeting");

    server.await.unwrap();
}

/// A connection that closes before sending anything is a no-op, not a panic.
#[tokio::test]
async fn empty_connection_is_ignored() {
    let (addr, server) = spawn_session().await;
    let client = TcpStream::connect(addr).await.unwrap();
    drop(client);
    server.await.unwrap();
}

/// spec.md §8 scenario 6: "Relay closes after TCP connect. Expect: no bytes
/// written to tunnel; local TCP closed; single log line naming the remote
/// endpoint." The outbound TCP connect itself succeeds (against a real
/// loopback listener standing in for the relay) but the relay closes
/// immediately, before any TLS bytes are exchanged, so the handshake fails.
#[tokio::test]
async fn tls_handshake_failure_closes_local_connection() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let relay_task = tokio::spawn(async move {
        let (stream, _) = relay.accept().await.unwrap();
        drop(stream);
    });

    let (addr, server) = spawn_session_with_remote(relay_addr).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).await.unwrap();
    assert_eq!(greeting_reply, [0x05, 0x00]);

    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
        .await
        .unwrap();
    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    // The outbound TLS handshake fails against the closed relay connection;
    // the session destroys itself and the local peer sees nothing further.
    let mut trailing = [0u8; 1];
    let n = client.read(&mut trailing).await.unwrap();
    assert_eq!(n, 0, "local connection must close, nothing is forwarded");

    server.await.unwrap();
    relay_task.await.unwrap();
}
