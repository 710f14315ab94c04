//! Per-call TCP and TLS connections to the trapper server.

pub mod certificates;
pub mod trust;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ServerName, SupportedProtocolVersion};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{SenderConfig, TlsProtocols};
use crate::errors::{TransportError, TrapperError};
use crate::protocol;

use self::certificates::{load_pinned_certificate, root_store, ClientCertificateSource};
use self::trust::{PinningVerifier, TrustPolicy};

/// Size of the buffer a response frame is read into.
pub const RESPONSE_BUFFER_SIZE: usize = 512;

struct TlsSettings {
    connector: TlsConnector,
    server_name: ServerName,
    host: String,
}

/// Opens a fresh connection for every exchange. TLS material is resolved
/// once, when the client is built.
pub struct TransportClient {
    address: String,
    port: u16,
    tls: Option<TlsSettings>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("tls", &self.tls.as_ref().map(|t| &t.host))
            .finish()
    }
}

impl TransportClient {
    pub fn new(config: &SenderConfig) -> Result<Self, TrapperError> {
        let tls = if config.use_encryption {
            Some(build_tls(config)?)
        } else {
            None
        };

        Ok(Self {
            address: config.server_address.clone(),
            port: config.port,
            tls,
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.tls.is_some()
    }

    /// Write `frame` and read back the raw response bytes.
    ///
    /// The connection is dropped, and thereby closed, on every return path.
    pub async fn exchange(&self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let address = format!("{}:{}", self.address, self.port);
        let tcp = bounded("connect", self.connect_timeout, TcpStream::connect(address.as_str()))
            .await?
            .map_err(|source| TransportError::Connect {
                address: address.clone(),
                source,
            })?;
        debug!(%address, encrypted = self.is_encrypted(), "connected to trapper server");

        match &self.tls {
            Some(tls) => {
                let handshake = tls.connector.connect(tls.server_name.clone(), tcp);
                let mut stream = bounded("TLS handshake", self.connect_timeout, handshake)
                    .await?
                    .map_err(|source| TransportError::Handshake {
                        host: tls.host.clone(),
                        source,
                    })?;
                round_trip(&mut stream, frame, self.io_timeout).await
            }
            None => {
                let mut stream = tcp;
                round_trip(&mut stream, frame, self.io_timeout).await
            }
        }
    }
}

async fn bounded<F: Future>(
    operation: &'static str,
    after: Duration,
    future: F,
) -> Result<F::Output, TransportError> {
    tokio::time::timeout(after, future)
        .await
        .map_err(|_| TransportError::Timeout { operation, after })
}

async fn round_trip<S>(stream: &mut S, frame: &[u8], io_timeout: Duration) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    bounded("write", io_timeout, async {
        stream.write_all(frame).await?;
        stream.flush().await
    })
    .await??;

    let response = bounded("read", io_timeout, read_response(stream)).await??;

    // The server closes after answering; a failed shutdown changes nothing.
    let _ = stream.shutdown().await;
    Ok(response)
}

/// Read until EOF, a full buffer, or the complete frame the header declares.
async fn read_response<S>(stream: &mut S) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; RESPONSE_BUFFER_SIZE];
    let mut filled = 0;
    while filled < buffer.len() {
        let n = stream.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if protocol::is_complete(&buffer[..filled]) {
            break;
        }
    }
    buffer.truncate(filled);
    Ok(buffer)
}

fn protocol_versions(protocols: TlsProtocols) -> &'static [&'static SupportedProtocolVersion] {
    static TLS12: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
    static TLS13: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
    match protocols {
        TlsProtocols::SystemDefault => rustls::ALL_VERSIONS,
        TlsProtocols::Tls12 => TLS12,
        TlsProtocols::Tls13 => TLS13,
    }
}

fn build_tls(config: &SenderConfig) -> Result<TlsSettings, TrapperError> {
    let pinned_certificate = config
        .server_certificate_path
        .as_deref()
        .map(load_pinned_certificate)
        .transpose()?;

    let policy = TrustPolicy {
        pin_before_ca: config.pin_certificate_before_ca,
        pin_after_ca: config.pin_certificate_after_ca,
        pinned_certificate,
        thumbprint: config.server_thumbprint().map(str::to_string),
    };
    let roots = root_store(config.ca_certificate_path.as_deref())?;
    let verifier = PinningVerifier::new(policy, roots).into_arc();

    let builder = ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(protocol_versions(config.tls_protocols))?
        .with_custom_certificate_verifier(verifier);

    let client_config = match ClientCertificateSource::from_config(config) {
        Some(source) => {
            let identity = source.load()?;
            builder.with_client_auth_cert(identity.chain, identity.key)?
        }
        None => builder.with_no_client_auth(),
    };

    let host = config.target_host.trim().to_string();
    let server_name = ServerName::try_from(host.as_str())
        .map_err(|_| TrapperError::Config(format!("invalid TLS target host {host:?}")))?;

    Ok(TlsSettings {
        connector: TlsConnector::from(Arc::new(client_config)),
        server_name,
        host,
    })
}
