//! Broker addresses and the dial operation
//!
//! `tcp://` and `mqtt://` dial plain TCP (default port 1883); `ssl://`,
//! `tls://` and `mqtts://` wrap the TCP stream in rustls (default port 8883).

use crate::config::TlsOptions;
use crate::error::{ClientError, ClientResult};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Duplex byte stream to a broker
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A parsed broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddr {
    pub fn parse(raw: &str) -> ClientResult<Self> {
        let url = Url::parse(raw).map_err(|_| ClientError::InvalidBrokerUrl(raw.to_string()))?;
        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            _ => return Err(ClientError::InvalidBrokerUrl(raw.to_string())),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ClientError::InvalidBrokerUrl(raw.to_string()))?;
        // IPv6 literals come back bracketed
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });
        Ok(Self { host, port, tls })
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        if self.host.contains(':') {
            write!(f, "{scheme}://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{scheme}://{}:{}", self.host, self.port)
        }
    }
}

/// Open a stream to `broker`, bounded by `timeout`
pub async fn dial(
    broker: &BrokerAddr,
    tls: Option<&TlsOptions>,
    timeout: Duration,
) -> ClientResult<BoxedStream> {
    match tokio::time::timeout(timeout, dial_inner(broker, tls)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::ConnectTimeout {
            broker: broker.to_string(),
        }),
    }
}

async fn dial_inner(broker: &BrokerAddr, tls: Option<&TlsOptions>) -> ClientResult<BoxedStream> {
    let tcp = TcpStream::connect((broker.host.as_str(), broker.port))
        .await
        .map_err(|e| ClientError::NetworkError {
            broker: broker.to_string(),
            message: e.to_string(),
        })?;
    let _ = tcp.set_nodelay(true);

    if !broker.tls {
        debug!(broker = %broker, "TCP connection established");
        return Ok(Box::new(tcp));
    }

    let options = tls.cloned().unwrap_or_default();
    let config = build_client_config(&options)?;
    let name = options.server_name.as_deref().unwrap_or(&broker.host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| ClientError::Tls(format!("Invalid server name: {name}")))?;
    let stream = TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
        .map_err(|e| ClientError::NetworkError {
            broker: broker.to_string(),
            message: format!("TLS handshake failed: {e}"),
        })?;
    debug!(broker = %broker, "TLS connection established");
    Ok(Box::new(stream))
}

/// Build a rustls client configuration from [`TlsOptions`]
pub fn build_client_config(options: &TlsOptions) -> ClientResult<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    match &options.ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                root_store
                    .add(cert)
                    .map_err(|e| ClientError::Tls(format!("Failed to add CA cert: {e}")))?;
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ClientError::Tls(e.to_string()))?
    .with_root_certificates(root_store);

    match (&options.client_cert, &options.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let file = File::open(key_path)
                .map_err(|e| ClientError::Tls(format!("Failed to open client key: {e}")))?;
            let key = rustls_pemfile::private_key(&mut BufReader::new(file))
                .map_err(|e| ClientError::Tls(format!("Failed to parse client key: {e}")))?
                .ok_or_else(|| ClientError::Tls("No private key found in file".to_string()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::Tls(format!("Failed to configure client auth: {e}")))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(ClientError::Tls(
            "client_cert and client_key must be set together".to_string(),
        )),
    }
}

fn load_certs(path: &std::path::Path) -> ClientResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ClientError::Tls(format!("Failed to open {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Tls(format!("Failed to parse {}: {e}", path.display())))
}
