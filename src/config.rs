//! Client configuration: TOML-loaded, immutable once constructed, shared
//! (read-only) by every session it spawns — spec.md §3's "Config".

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use thiserror::Error;

fn default_true() -> bool {
    true
}

fn default_udp_timeout() -> u64 {
    60
}

/// Raw, on-disk shape of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawConfig {
    remote_addr: String,
    remote_port: u16,
    /// Plaintext shared secrets, in priority order. Hashed into
    /// `Config::passwords` at load time — see module docs on `Config`.
    password: Vec<String>,
    /// Local listen address for the SOCKS5 (or NAT-mode UDP) front end.
    local_addr: SocketAddr,

    #[serde(default)]
    ssl: SslConfig,
    #[serde(default)]
    tcp: TcpConfig,

    /// Delay the outbound connect until at least one user payload byte has
    /// been read (spec.md §3/§4.2 step 4).
    #[serde(default)]
    append_payload: bool,

    /// Seconds of idleness before a NAT-mode UDP session is destroyed.
    #[serde(default = "default_udp_timeout")]
    udp_timeout: u64,

    /// Fixed destination for NAT-mode UDP forwarding only.
    target_addr: Option<String>,
    target_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    /// Server name to present in the TLS ClientHello (SNI). Empty string
    /// (the default) means "use whatever the OS/rustls resolve naturally",
    /// matching the original's `config.ssl.sni != ""` check.
    #[serde(default)]
    pub sni: String,
    #[serde(default = "default_true")]
    pub reuse_session: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            sni: String::new(),
            reuse_session: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_true")]
    pub no_delay: bool,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub fast_open: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            keep_alive: false,
            fast_open: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("at least one password must be configured")]
    NoPassword,
    #[error("udp_timeout must be greater than zero")]
    ZeroUdpTimeout,
    #[error("NAT mode requires both target_addr and target_port")]
    MissingNatTarget,
}

/// Immutable per-session configuration (spec.md §3).
#[derive(Debug, Clone)]
pub struct Config {
    pub remote_addr: String,
    pub remote_port: u16,
    /// `(hex(sha224(plaintext)), plaintext)` pairs, insertion order
    /// preserved from the configuration file. The trojan framing (spec.md
    /// §4.1/§6) always uses `passwords[0].0` as the presented secret.
    pub passwords: Vec<(String, String)>,
    pub local_addr: SocketAddr,
    pub ssl: SslConfig,
    pub tcp: TcpConfig,
    pub append_payload: bool,
    pub udp_timeout: u64,
    pub target_addr: Option<String>,
    pub target_port: Option<u16>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let passwords = raw
            .password
            .iter()
            .map(|plaintext| (hash_password(plaintext), plaintext.clone()))
            .collect();

        let config = Config {
            remote_addr: raw.remote_addr,
            remote_port: raw.remote_port,
            passwords,
            local_addr: raw.local_addr,
            ssl: raw.ssl,
            tcp: raw.tcp,
            append_payload: raw.append_payload,
            udp_timeout: raw.udp_timeout,
            target_addr: raw.target_addr,
            target_port: raw.target_port,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.passwords.is_empty() {
            return Err(ConfigError::NoPassword);
        }
        if self.udp_timeout == 0 {
            return Err(ConfigError::ZeroUdpTimeout);
        }
        Ok(())
    }

    pub fn validate_nat_mode(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.target_addr.is_none() || self.target_port.is_none() {
            return Err(ConfigError::MissingNatTarget);
        }
        Ok(())
    }

    /// The hex password digest presented in the trojan framing — the first
    /// configured password's key (spec.md §4.1: "the first key of the
    /// configured password mapping").
    pub fn password_hex(&self) -> &str {
        &self.passwords[0].0
    }
}

/// `hex(sha224(password))`, the shared secret presented over the wire.
fn hash_password(password: &str) -> String {
    let digest = Sha224::digest(password.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raw() -> RawConfig {
        RawConfig {
            remote_addr: "relay.example.com".to_string(),
            remote_port: 443,
            password: vec!["hunter2".to_string(), "fallback".to_string()],
            local_addr: "127.0.0.1:1080".parse().unwrap(),
            ssl: SslConfig::default(),
            tcp: TcpConfig::default(),
            append_payload: false,
            udp_timeout: 60,
            target_addr: None,
            target_port: None,
        }
    }

    #[test]
    fn password_order_is_preserved_and_hashed() {
        let config = Config::from_raw(sample_raw()).unwrap();
        assert_eq!(config.passwords.len(), 2);
        assert_eq!(config.passwords[0].1, "hunter2");
        assert_eq!(config.passwords[1].1, "fallback");
        assert_eq!(config.password_hex(), config.passwords[0].0);
        // sha224("hunter2") hex digest, computed independently.
        assert_eq!(
            config.password_hex(),
            "84ca85078d6fa3a9b01dae0242938a9b71c9c6920f8d790505cad7a7"
        );
    }

    #[test]
    fn rejects_empty_password_list() {
        let mut raw = sample_raw();
        raw.password.clear();
        assert!(matches!(
            Config::from_raw(raw),
            Err(ConfigError::NoPassword)
        ));
    }

    #[test]
    fn rejects_zero_udp_timeout() {
        let mut raw = sample_raw();
        raw.udp_timeout = 0;
        assert!(matches!(
            Config::from_raw(raw),
            Err(ConfigError::ZeroUdpTimeout)
        ));
    }

    #[test]
    fn nat_mode_requires_target() {
        let raw = sample_raw();
        let config = Config::from_raw(raw).unwrap();
        assert!(matches!(
            config.validate_nat_mode(),
            Err(ConfigError::MissingNatTarget)
        ));
    }
}
