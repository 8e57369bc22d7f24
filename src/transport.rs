//! TCP/TLS stream establishment

use crate::error::{AmiError, AmiResult};
use crate::manager::ManagerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Full-duplex byte stream over TCP or TLS.
pub(crate) trait AmiIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AmiIo for T {}

/// Boxed stream handed to the reader/writer split.
pub(crate) type IoStream = Box<dyn AmiIo>;

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> AmiResult<TcpStream> {
    let timeout_ms = connect_timeout.as_millis() as u64;
    let tcp_result = timeout(connect_timeout, TcpStream::connect((host, port))).await;

    match tcp_result {
        Ok(Ok(s)) => {
            debug!("TCP connection established to {}:{}", host, port);
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("TCP connect to {}:{} failed: {}", host, port, e);
            Err(AmiError::Io(e))
        }
        Err(_) => {
            warn!(
                "TCP connect to {}:{} timed out after {}ms",
                host, port, timeout_ms
            );
            Err(AmiError::Timeout { timeout_ms })
        }
    }
}

/// Build a rustls connector from the configured CA bundle.
fn tls_connector(config: &ManagerConfig) -> AmiResult<TlsConnector> {
    let ca_file = config
        .tls_ca_file
        .as_ref()
        .ok_or_else(|| {
            AmiError::tls_config("tls enabled but no tls_ca_file configured")
        })?;

    let pem = std::fs::read(ca_file)?;
    let mut root_store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|e| {
            AmiError::tls_config(format!("failed to parse CA certificate: {}", e))
        })?;
        root_store
            .add(cert)
            .map_err(|e| AmiError::tls_config(format!("failed to add CA certificate: {}", e)))?;
    }
    if root_store.is_empty() {
        return Err(AmiError::tls_config(format!(
            "no CA certificates found in {}",
            ca_file.display()
        )));
    }

    let client_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Open the configured transport: plain TCP, or TLS over TCP when
/// `config.tls` is set.
pub(crate) async fn connect(config: &ManagerConfig) -> AmiResult<IoStream> {
    let tcp = tcp_connect_with_timeout(&config.host, config.port, config.connect_timeout).await?;

    if !config.tls {
        return Ok(Box::new(tcp));
    }

    let connector = tls_connector(config)?;
    let server_name = ServerName::try_from(
        config
            .host
            .clone(),
    )
    .map_err(|e| AmiError::tls_config(format!("invalid TLS server name: {}", e)))?;
    let stream = connector
        .connect(server_name, tcp)
        .await?;
    debug!("TLS handshake complete with {}", config.host);
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;

    #[tokio::test]
    async fn tls_without_ca_file_is_a_config_error() {
        let config = ManagerConfig {
            tls: true,
            ..ManagerConfig::default()
        };
        assert!(matches!(
            tls_connector(&config),
            Err(AmiError::TlsConfig { .. })
        ));
    }

    #[tokio::test]
    async fn connect_timeout_is_configurable() {
        // TEST-NET-3 address, unroutable in practice: the connect either
        // hangs until the configured timeout or errors immediately
        let config = ManagerConfig {
            host: "203.0.113.1".to_string(),
            connect_timeout: Duration::from_millis(50),
            ..ManagerConfig::default()
        };
        let start = std::time::Instant::now();
        assert!(connect(&config)
            .await
            .is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn connect_refused_is_io_error() {
        let config = ManagerConfig {
            host: "127.0.0.1".to_string(),
            // Reserved port nothing listens on in the test environment
            port: 1,
            ..ManagerConfig::default()
        };
        assert!(matches!(
            connect(&config).await,
            Err(AmiError::Io(_) | AmiError::Timeout { .. })
        ));
    }
}
