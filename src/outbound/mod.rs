//! Outbound connections to fallback relays

pub mod tls;

use crate::common::net::configure_tcp_stream;
use crate::config::Config;
use crate::provider::TrustedFallback;
use crate::{Error, Result};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Opens TLS connections to fallbacks
#[derive(Debug, Clone, Copy)]
pub struct FallbackDialer {
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl FallbackDialer {
    pub fn new(connect_timeout: Duration, handshake_timeout: Duration) -> Self {
        FallbackDialer {
            connect_timeout,
            handshake_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.dial_timeout(), config.handshake_timeout())
    }

    /// TCP connect plus TLS handshake using the fallback's own trust config
    pub async fn dial(&self, fallback: &TrustedFallback) -> Result<TlsStream<TcpStream>> {
        let addr = fallback.address();

        let tcp = timeout(self.connect_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| Error::connection(format!("TCP timeout ({})", addr)))?
            .map_err(|e| Error::connection(format!("TCP connect ({}): {}", addr, e)))?;
        configure_tcp_stream(&tcp);

        let server_name: ServerName<'static> = fallback
            .host()
            .to_string()
            .try_into()
            .map_err(|_| Error::tls(format!("Invalid server name: {}", fallback.host())))?;

        let connector = TlsConnector::from(fallback.tls_config());
        let stream = timeout(self.handshake_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::tls(format!("TLS timeout ({})", addr)))?
            .map_err(|e| Error::tls(format!("TLS failed ({}): {}", addr, e)))?;

        debug!(upstream = %addr, "fallback connected");
        Ok(stream)
    }
}

impl Default for FallbackDialer {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
