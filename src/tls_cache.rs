//! Process-wide TLS session resumption cache (spec.md §4.4).
//!
//! The original C++ implementation keeps a single mutable `SSL_SESSION*`
//! slot: attach the last-seen ticket before each handshake, replace it after
//! each successful one. rustls has no direct equivalent of `SSL_set_session`
//! — resumption is driven by a `ClientSessionStore` trait object shared by
//! the `ClientConfig`, consulted automatically on every handshake for a
//! matching server name. `Resumption::in_memory_sessions(1)` is rustls' own
//! bounded LRU store sized to exactly one entry, which gives the same
//! single-slot, replace-on-success behavior without any manual get/set
//! calls — the idiomatic translation, not an approximation.

use std::sync::{Arc, OnceLock, Once};

use rustls::{ClientConfig, RootCertStore};

static CRYPTO_PROVIDER_INIT: Once = Once::new();
static RESUMING_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
static PLAIN_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

fn install_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn root_store() -> RootCertStore {
    let mut store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        result if !result.certs.is_empty() => {
            for cert in result.certs {
                let _ = store.add(cert);
            }
            for err in result.errors {
                log::warn!("failed to load a native root certificate: {err}");
            }
        }
        result => {
            for err in result.errors {
                log::warn!("failed to load native root certificates: {err}");
            }
        }
    }
    store
}

fn build_config(reuse_session: bool) -> Arc<ClientConfig> {
    install_crypto_provider();
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store())
        .with_no_client_auth();
    config.resumption = if reuse_session {
        rustls::client::Resumption::in_memory_sessions(1)
    } else {
        rustls::client::Resumption::disabled()
    };
    Arc::new(config)
}

/// Returns the process-wide shared `ClientConfig` for the given
/// `reuse_session` setting, building it on first use. Two configs are
/// cached (resuming / non-resuming) because `Config::ssl.reuse_session` can
/// differ across sessions sharing one process, but each is itself a single
/// shared slot — exactly the invariant spec.md §4.4 describes.
pub fn client_config(reuse_session: bool) -> Arc<ClientConfig> {
    if reuse_session {
        RESUMING_CONFIG
            .get_or_init(|| build_config(true))
            .clone()
    } else {
        PLAIN_CONFIG.get_or_init(|| build_config(false)).clone()
    }
}
