//! Certificate loading: client identities, pinned server certificates and
//! extra trust anchors.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use rustls::{Certificate, OwnedTrustAnchor, PrivateKey, RootCertStore};
use rustls_pemfile::Item;
use tracing::{debug, info};

use crate::config::{SenderConfig, StoreLocation};
use crate::errors::TrapperError;
use crate::transport::trust::thumbprint_matches;

const APP_DIR: &str = "trapper-sender";

/// Certificate chain and key presented to the server for mutual TLS.
pub struct ClientIdentity {
    pub chain: Vec<Certificate>,
    pub key: PrivateKey,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Where the client certificate comes from.
#[derive(Debug)]
pub enum ClientCertificateSource {
    /// A PEM certificate chain, with its key bundled or in a separate file.
    File {
        certificate: PathBuf,
        key: Option<PathBuf>,
        password_configured: bool,
    },
    /// A directory of PEM files searched by thumbprint.
    Store { directory: PathBuf, thumbprint: String },
}

impl ClientCertificateSource {
    /// Pick the source from configuration. A certificate path wins over a
    /// store thumbprint; `None` means no client certificate is presented.
    pub fn from_config(config: &SenderConfig) -> Option<Self> {
        if let Some(path) = &config.client_certificate_path {
            return Some(ClientCertificateSource::File {
                certificate: path.clone(),
                key: config.client_certificate_key_path.clone(),
                password_configured: config.client_certificate_password.is_some(),
            });
        }
        config.client_thumbprint().map(|thumbprint| ClientCertificateSource::Store {
            directory: store_directory(
                config.client_certificate_store_location,
                &config.client_certificate_store_name,
            ),
            thumbprint: thumbprint.to_string(),
        })
    }

    pub fn load(&self) -> Result<ClientIdentity, TrapperError> {
        match self {
            ClientCertificateSource::File {
                certificate,
                key,
                password_configured,
            } => {
                let key_path = key.as_deref().unwrap_or(certificate.as_path());
                let identity = ClientIdentity {
                    chain: load_certificates(certificate)?,
                    key: load_private_key(key_path, *password_configured)?,
                };
                info!(path = %certificate.display(), "loaded client certificate from file");
                Ok(identity)
            }
            ClientCertificateSource::Store {
                directory,
                thumbprint,
            } => find_in_store(directory, thumbprint),
        }
    }
}

/// Directory backing a named certificate store.
pub fn store_directory(location: StoreLocation, name: &str) -> PathBuf {
    let root = match location {
        StoreLocation::CurrentUser => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("certs"),
        StoreLocation::LocalMachine => PathBuf::from("/etc").join(APP_DIR).join("certs"),
    };
    root.join(name)
}

fn read_pem_items(path: &Path) -> Result<Vec<Item>, TrapperError> {
    let file = fs::File::open(path).map_err(|e| {
        TrapperError::Certificate(format!("cannot open {}: {e}", path.display()))
    })?;
    rustls_pemfile::read_all(&mut BufReader::new(file)).map_err(|e| {
        TrapperError::Certificate(format!("cannot parse {}: {e}", path.display()))
    })
}

/// Load every certificate in a PEM file.
pub fn load_certificates(path: &Path) -> Result<Vec<Certificate>, TrapperError> {
    let chain: Vec<Certificate> = read_pem_items(path)?
        .into_iter()
        .filter_map(|item| match item {
            Item::X509Certificate(der) => Some(Certificate(der)),
            _ => None,
        })
        .collect();

    if chain.is_empty() {
        return Err(TrapperError::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(chain)
}

/// Load the first unencrypted private key in a PEM file.
pub fn load_private_key(path: &Path, password_configured: bool) -> Result<PrivateKey, TrapperError> {
    read_pem_items(path)?
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| {
            let hint = if password_configured {
                " (encrypted private keys are not supported; decrypt the key first)"
            } else {
                ""
            };
            TrapperError::Certificate(format!("no private key found in {}{hint}", path.display()))
        })
}

/// Load a pinned server certificate as DER. PEM files use their first
/// certificate; anything else is taken as raw DER.
pub fn load_pinned_certificate(path: &Path) -> Result<Vec<u8>, TrapperError> {
    let bytes = fs::read(path).map_err(|e| {
        TrapperError::Certificate(format!("cannot read {}: {e}", path.display()))
    })?;

    if bytes.starts_with(b"-----BEGIN") {
        let mut certs = rustls_pemfile::certs(&mut bytes.as_slice()).map_err(|e| {
            TrapperError::Certificate(format!("cannot parse {}: {e}", path.display()))
        })?;
        if certs.is_empty() {
            return Err(TrapperError::Certificate(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
        return Ok(certs.swap_remove(0));
    }
    Ok(bytes)
}

fn find_in_store(directory: &Path, thumbprint: &str) -> Result<ClientIdentity, TrapperError> {
    let entries = fs::read_dir(directory).map_err(|e| {
        TrapperError::Certificate(format!(
            "cannot open certificate store {}: {e}",
            directory.display()
        ))
    })?;

    for entry in entries {
        let path = entry?.path();
        let is_pem = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("pem" | "crt" | "cer")
        );
        if !is_pem {
            continue;
        }

        let Ok(chain) = load_certificates(&path) else {
            debug!(path = %path.display(), "skipping unreadable store entry");
            continue;
        };
        if !thumbprint_matches(thumbprint, &chain[0].0) {
            continue;
        }

        let key = load_private_key(&path, false)
            .or_else(|_| load_private_key(&path.with_extension("key"), false))?;
        info!(path = %path.display(), "loaded client certificate from store");
        return Ok(ClientIdentity { chain, key });
    }

    Err(TrapperError::Certificate(format!(
        "no certificate with thumbprint {thumbprint} in store {}",
        directory.display()
    )))
}

/// Mozilla roots plus any anchors from `extra_ca`.
pub fn root_store(extra_ca: Option<&Path>) -> Result<RootCertStore, TrapperError> {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    if let Some(path) = extra_ca {
        for cert in load_certificates(path)? {
            roots.add(&cert).map_err(|e| {
                TrapperError::Certificate(format!("invalid CA certificate in {}: {e:?}", path.display()))
            })?;
        }
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::trust::sha1_thumbprint;
    use tempfile::TempDir;

    struct TestCert {
        der: Vec<u8>,
        key_der: Vec<u8>,
        pem: String,
        key_pem: String,
    }

    fn self_signed() -> TestCert {
        let cert = rcgen::generate_simple_self_signed(vec!["client.local".to_string()])
            .expect("Should generate certificate");
        // Each serialization re-signs, so derive the DER from the PEM we write out.
        let pem = cert.serialize_pem().expect("Should serialize certificate");
        let der = rustls_pemfile::certs(&mut pem.as_bytes())
            .expect("Should parse generated PEM")
            .remove(0);
        TestCert {
            der,
            key_der: cert.serialize_private_key_der(),
            pem,
            key_pem: cert.serialize_private_key_pem(),
        }
    }

    #[test]
    fn test_file_source_with_bundled_key() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let cert = self_signed();
        let path = temp_dir.path().join("client.pem");
        fs::write(&path, format!("{}{}", cert.pem, cert.key_pem)).unwrap();

        let mut config = SenderConfig::default();
        config.client_certificate_path = Some(path);
        let source = ClientCertificateSource::from_config(&config).expect("Should pick file source");
        let identity = source.load().expect("Should load identity");

        assert_eq!(identity.chain.len(), 1);
        assert_eq!(identity.chain[0].0, cert.der);
        assert_eq!(identity.key.0, cert.key_der);
    }

    #[test]
    fn test_file_source_with_separate_key() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let cert = self_signed();
        let cert_path = temp_dir.path().join("client.crt");
        let key_path = temp_dir.path().join("client-key.pem");
        fs::write(&cert_path, &cert.pem).unwrap();
        fs::write(&key_path, &cert.key_pem).unwrap();

        let source = ClientCertificateSource::File {
            certificate: cert_path,
            key: Some(key_path),
            password_configured: false,
        };
        let identity = source.load().expect("Should load identity");
        assert_eq!(identity.key.0, cert.key_der);
    }

    #[test]
    fn test_missing_key_mentions_encryption_when_password_set() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let cert = self_signed();
        let path = temp_dir.path().join("client.pem");
        fs::write(&path, &cert.pem).unwrap();

        let err = load_private_key(&path, true).unwrap_err();
        assert!(err.to_string().contains("encrypted private keys are not supported"));
    }

    #[test]
    fn test_store_lookup_uses_client_thumbprint() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = temp_dir.path().join("My");
        fs::create_dir_all(&store).unwrap();

        let wanted = self_signed();
        let other = self_signed();
        fs::write(store.join("other.pem"), &other.pem).unwrap();
        fs::write(store.join("other.key"), &other.key_pem).unwrap();
        fs::write(store.join("wanted.pem"), &wanted.pem).unwrap();
        fs::write(store.join("wanted.key"), &wanted.key_pem).unwrap();
        fs::write(store.join("notes.txt"), "not a certificate").unwrap();

        let source = ClientCertificateSource::Store {
            directory: store,
            thumbprint: sha1_thumbprint(&wanted.der).to_ascii_lowercase(),
        };
        let identity = source.load().expect("Should find certificate");
        assert_eq!(identity.chain[0].0, wanted.der);
        assert_eq!(identity.key.0, wanted.key_der);
    }

    #[test]
    fn test_store_source_ignores_server_thumbprint() {
        let mut config = SenderConfig::default();
        config.server_certificate_thumbprint = Some("AA".repeat(20));
        assert!(ClientCertificateSource::from_config(&config).is_none());

        config.client_certificate_thumbprint = Some("BB".repeat(20));
        match ClientCertificateSource::from_config(&config) {
            Some(ClientCertificateSource::Store { thumbprint, directory }) => {
                assert_eq!(thumbprint, "BB".repeat(20));
                assert!(directory.ends_with("My"));
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn test_pinned_certificate_pem_and_der() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let cert = self_signed();

        let pem_path = temp_dir.path().join("server.crt");
        fs::write(&pem_path, &cert.pem).unwrap();
        assert_eq!(load_pinned_certificate(&pem_path).unwrap(), cert.der);

        let der_path = temp_dir.path().join("server.der");
        fs::write(&der_path, &cert.der).unwrap();
        assert_eq!(load_pinned_certificate(&der_path).unwrap(), cert.der);
    }

    #[test]
    fn test_root_store_accepts_extra_ca() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let cert = self_signed();
        let path = temp_dir.path().join("ca.pem");
        fs::write(&path, &cert.pem).unwrap();

        let bundled = root_store(None).expect("Should build root store").len();
        let extended = root_store(Some(&path)).expect("Should add CA").len();
        assert_eq!(extended, bundled + 1);
    }
}
