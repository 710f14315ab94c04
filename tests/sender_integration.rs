//! End-to-end sends against an in-process trapper server, over plain TCP
//! and over TLS with the various trust settings.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use trapper_sender::protocol::{self, HEADER_LEN};
use trapper_sender::transport::trust::sha1_thumbprint;
use trapper_sender::{Sender, SenderConfig, TransportError, TrapperError, TrapperItem};

const ACK: &str = r#"{"response":"success","info":"processed: 2; failed: 0; total: 2; seconds spent: 0.000071"}"#;

struct ServerCert {
    der: Vec<u8>,
    pem: String,
    key_der: Vec<u8>,
}

fn server_cert() -> ServerCert {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("Should generate certificate");
    // Serializing signs again, so take the DER from the PEM rather than
    // serializing twice.
    let pem = cert.serialize_pem().expect("Should serialize certificate");
    let der = rustls_pemfile::certs(&mut pem.as_bytes())
        .expect("Should parse generated PEM")
        .remove(0);
    ServerCert {
        der,
        pem,
        key_der: cert.serialize_private_key_der(),
    }
}

fn acceptor(cert: &ServerCert) -> TlsAcceptor {
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::Certificate(cert.der.clone())],
            rustls::PrivateKey(cert.key_der.clone()),
        )
        .expect("Should build server config");
    TlsAcceptor::from(Arc::new(config))
}

async fn answer<S>(stream: &mut S) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let len = protocol::declared_len(&header).expect("Request must carry a valid header");
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    let reply = protocol::frame(ACK.as_bytes()).expect("Should frame reply");
    stream.write_all(&reply).await?;
    stream.shutdown().await?;
    Ok(payload)
}

/// Serve a single request; yields the request payload, or `None` if the
/// connection failed (for example a rejected handshake).
async fn spawn_server(tls: Option<TlsAcceptor>) -> (u16, JoinHandle<Option<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.ok()?;
        match tls {
            Some(acceptor) => {
                let mut stream = acceptor.accept(tcp).await.ok()?;
                answer(&mut stream).await.ok()
            }
            None => {
                let mut stream = tcp;
                answer(&mut stream).await.ok()
            }
        }
    });
    (port, handle)
}

fn items() -> Vec<TrapperItem> {
    vec![
        TrapperItem::new("cpu.usage", "12.5"),
        TrapperItem::new("thread.count", "14"),
    ]
}

fn tls_config(port: u16) -> SenderConfig {
    let mut config = SenderConfig::new("127.0.0.1", port, "integration-host");
    config.use_encryption = true;
    config.target_host = "localhost".to_string();
    config
}

fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn assert_handshake_rejected(result: Result<String, TrapperError>) {
    match result {
        Err(TrapperError::Send(TransportError::Handshake { .. })) => {}
        other => panic!("expected a handshake failure, got {other:?}"),
    }
}

#[tokio::test]
async fn plain_tcp_round_trip() {
    let (port, server) = spawn_server(None).await;
    let sender = Sender::new(Arc::new(SenderConfig::new("127.0.0.1", port, "integration-host"))).unwrap();

    let response = sender.send_items(&items()).await.expect("Should send");
    assert_eq!(response, ACK);

    let payload = server.await.unwrap().expect("Server should see the request");
    let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(json["request"], "sender data");
    assert_eq!(json["data"][0]["host"], "integration-host");
    assert_eq!(json["data"][1]["value"], "14");
}

#[tokio::test]
async fn tls_pinned_thumbprint_before_ca_accepts_self_signed() {
    let cert = server_cert();
    let (port, server) = spawn_server(Some(acceptor(&cert))).await;

    let mut config = tls_config(port);
    config.pin_certificate_before_ca = true;
    let thumbprint = sha1_thumbprint(&cert.der).to_ascii_lowercase();
    config.server_certificate_thumbprint = Some(format!(" {} ", thumbprint));

    let sender = Sender::new(Arc::new(config)).unwrap();
    let response = sender.send_items(&items()).await.expect("Pinned certificate should be trusted");
    assert_eq!(response, ACK);
    assert!(server.await.unwrap().is_some());
}

#[tokio::test]
async fn tls_pinned_file_before_ca_accepts_self_signed() {
    let cert = server_cert();
    let dir = TempDir::new().unwrap();
    let pinned = write_file(&dir, "server.der", &cert.der);
    let (port, _server) = spawn_server(Some(acceptor(&cert))).await;

    let mut config = tls_config(port);
    config.pin_certificate_before_ca = true;
    config.server_certificate_path = Some(pinned);

    let sender = Sender::new(Arc::new(config)).unwrap();
    assert_eq!(sender.send("cpu.usage", "1").await.expect("Should send"), ACK);
}

#[tokio::test]
async fn tls_without_pins_rejects_untrusted_certificate() {
    let cert = server_cert();
    let (port, server) = spawn_server(Some(acceptor(&cert))).await;

    let sender = Sender::new(Arc::new(tls_config(port))).unwrap();
    assert_handshake_rejected(sender.send_items(&items()).await);
    assert!(server.await.unwrap().is_none());
}

#[tokio::test]
async fn tls_pin_after_ca_still_requires_valid_chain() {
    let cert = server_cert();
    let (port, _server) = spawn_server(Some(acceptor(&cert))).await;

    let mut config = tls_config(port);
    config.pin_certificate_after_ca = true;
    config.server_certificate_thumbprint = Some(sha1_thumbprint(&cert.der));

    let sender = Sender::new(Arc::new(config)).unwrap();
    assert_handshake_rejected(sender.send_items(&items()).await);
}

#[tokio::test]
async fn tls_custom_ca_with_pin_after_ca() {
    let cert = server_cert();
    let dir = TempDir::new().unwrap();
    let ca = write_file(&dir, "ca.pem", cert.pem.as_bytes());

    // Matching thumbprint on a chain that validates.
    let (port, _server) = spawn_server(Some(acceptor(&cert))).await;
    let mut config = tls_config(port);
    config.ca_certificate_path = Some(ca.clone());
    config.pin_certificate_after_ca = true;
    config.server_certificate_thumbprint = Some(sha1_thumbprint(&cert.der));
    let sender = Sender::new(Arc::new(config)).unwrap();
    assert_eq!(sender.send_items(&items()).await.expect("Should send"), ACK);

    // Valid chain, wrong pin.
    let (port, _server) = spawn_server(Some(acceptor(&cert))).await;
    let mut config = tls_config(port);
    config.ca_certificate_path = Some(ca);
    config.pin_certificate_after_ca = true;
    config.server_certificate_thumbprint = Some("00".repeat(20));
    let sender = Sender::new(Arc::new(config)).unwrap();
    assert_handshake_rejected(sender.send_items(&items()).await);
}
