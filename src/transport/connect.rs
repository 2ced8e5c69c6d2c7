//! Connecting to relays over TCP, optionally with TLS.
//!
//! [`TcpConnector`] is a [`tower::Service`] from a target [`Uri`] to a boxed byte
//! stream. Exchange and upgrade transports use it to open one connection per tunnel.

use std::fmt;
#[cfg(feature = "tls")]
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use tokio::net::TcpStream;
use tracing::trace;

use super::{host_and_port, is_secure, BoxIo};
use crate::{BoxError, BoxFuture};

/// Opens TCP connections, wrapping them in TLS for `https` and `wss` targets.
#[derive(Clone, Default)]
pub struct TcpConnector {
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("TcpConnector");
        #[cfg(feature = "tls")]
        dbg.field("tls", &self.tls.is_some());
        dbg.finish()
    }
}

impl TcpConnector {
    /// A connector for plain-text targets only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` for `https` and `wss` targets.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    async fn connect(self, uri: Uri) -> Result<BoxIo, BoxError> {
        let (host, port) = host_and_port(&uri)?;

        trace!(%host, port, "tcp connect");
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        if !is_secure(&uri) {
            return Ok(Box::new(stream));
        }

        #[cfg(feature = "tls")]
        if let Some(config) = self.tls {
            let domain = rustls::pki_types::ServerName::try_from(host.to_owned())?;
            trace!(%host, "tls handshake");
            let stream = tokio_rustls::TlsConnector::from(config)
                .connect(domain, stream)
                .await?;
            return Ok(Box::new(stream));
        }

        Err(format!("no TLS configuration for {uri}").into())
    }
}

impl tower::Service<Uri> for TcpConnector {
    type Response = BoxIo;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<BoxIo, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}

/// The connector used by the built-in carriers.
///
/// With the `tls` feature, secure targets use [`default_tls_config`] offering only
/// `alpn`, so the negotiated protocol always matches the handshake the carrier performs.
/// If no TLS configuration can be built, secure targets fail to connect.
pub(crate) fn default_connector(alpn: &'static [u8]) -> TcpConnector {
    #[cfg(feature = "tls")]
    match default_tls_config(&[alpn]) {
        Ok(config) => return TcpConnector::new().with_tls(Arc::new(config)),
        Err(error) => tracing::warn!(%error, "TLS is unavailable"),
    }

    #[cfg(not(feature = "tls"))]
    let _ = alpn;

    TcpConnector::new()
}

/// Get a default TLS client configuration by loading the platform's native certificates.
///
/// `alpn` lists the protocols to offer, e.g. `[b"h2"]` for an HTTP/2 transport. Uses the
/// process-wide rustls crypto provider if one is installed, and otherwise the one selected
/// by the `tls-ring` or `tls-aws-lc` feature.
#[cfg(feature = "tls")]
pub fn default_tls_config(alpn: &[&[u8]]) -> Result<rustls::ClientConfig, BoxError> {
    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .or_else(feature_provider)
        .ok_or("no rustls crypto provider is available")?;

    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        tracing::warn!(%error, "could not load platform certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::trace!(added, ignored, "loaded platform certificates");

    let mut cfg = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    cfg.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
    Ok(cfg)
}

#[cfg(feature = "tls")]
fn feature_provider() -> Option<Arc<rustls::crypto::CryptoProvider>> {
    #[cfg(feature = "tls-ring")]
    return Some(Arc::new(rustls::crypto::ring::default_provider()));

    #[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
    return Some(Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    #[cfg(not(any(feature = "tls-ring", feature = "tls-aws-lc")))]
    None
}
