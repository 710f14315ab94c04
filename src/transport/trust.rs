//! Server certificate trust decisions.
//!
//! Order of evaluation:
//! 1. pin-before-CA: an exact match on the pinned certificate file or the
//!    configured thumbprint is accepted without looking at the chain;
//! 2. CA chain validation, optionally followed by a thumbprint check when
//!    pin-after-CA is set;
//! 3. anything else is rejected.

use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier, WebPkiVerifier,
};
use rustls::{Certificate, CertificateError, DigitallySignedStruct, ServerName, SignatureScheme};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Uppercase hex with whitespace and `:` separators removed.
pub fn normalize_thumbprint(thumbprint: &str) -> String {
    thumbprint
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect::<String>()
        .to_ascii_uppercase()
}

/// SHA-1 thumbprint of a DER certificate, as certificate stores display it.
pub fn sha1_thumbprint(der: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(der))
}

pub fn sha256_thumbprint(der: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(der))
}

/// Compare `der` against a configured thumbprint. The digest is picked by the
/// thumbprint length: 40 hex digits for SHA-1, 64 for SHA-256.
pub fn thumbprint_matches(expected: &str, der: &[u8]) -> bool {
    let expected = normalize_thumbprint(expected);
    match expected.len() {
        40 => sha1_thumbprint(der) == expected,
        64 => sha256_thumbprint(der) == expected,
        _ => false,
    }
}

/// Outcome of evaluating a presented server certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// Matched a pin before any CA validation.
    Pinned,
    /// Chain validated against the trust anchors.
    ChainValid,
    /// Chain validated and the thumbprint matched the pin.
    ChainValidAndPinned,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    ChainInvalid(String),
    ThumbprintMismatch,
}

impl TrustDecision {
    pub fn is_trusted(&self) -> bool {
        !matches!(self, TrustDecision::Rejected(_))
    }
}

/// Certificate-trust settings resolved from the sender configuration.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    pub pin_before_ca: bool,
    pub pin_after_ca: bool,
    /// DER bytes of a pinned server certificate.
    pub pinned_certificate: Option<Vec<u8>>,
    pub thumbprint: Option<String>,
}

impl TrustPolicy {
    fn matches_pin(&self, presented: &[u8]) -> bool {
        if self
            .pinned_certificate
            .as_deref()
            .is_some_and(|pinned| pinned == presented)
        {
            return true;
        }
        self.matches_thumbprint(presented)
    }

    fn matches_thumbprint(&self, presented: &[u8]) -> bool {
        self.thumbprint
            .as_deref()
            .is_some_and(|expected| thumbprint_matches(expected, presented))
    }

    /// Decide whether `presented` (DER) is trusted. `validate_chain` is only
    /// called when a pin-before-CA match did not already settle the question.
    pub fn evaluate<F>(&self, presented: &[u8], validate_chain: F) -> TrustDecision
    where
        F: FnOnce() -> Result<(), String>,
    {
        if self.pin_before_ca && self.matches_pin(presented) {
            return TrustDecision::Pinned;
        }

        if let Err(reason) = validate_chain() {
            return TrustDecision::Rejected(RejectReason::ChainInvalid(reason));
        }

        if !self.pin_after_ca {
            return TrustDecision::ChainValid;
        }
        if self.matches_thumbprint(presented) {
            TrustDecision::ChainValidAndPinned
        } else {
            TrustDecision::Rejected(RejectReason::ThumbprintMismatch)
        }
    }
}

/// rustls verifier applying a [`TrustPolicy`] on top of WebPKI validation.
pub struct PinningVerifier {
    policy: TrustPolicy,
    webpki: WebPkiVerifier,
}

impl PinningVerifier {
    pub fn new(policy: TrustPolicy, roots: rustls::RootCertStore) -> Self {
        Self {
            policy,
            webpki: WebPkiVerifier::new(roots, None),
        }
    }

    pub fn into_arc(self) -> Arc<dyn ServerCertVerifier> {
        Arc::new(self)
    }
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut chain_error = None;
        let decision = self.policy.evaluate(&end_entity.0, || {
            self.webpki
                .verify_server_cert(end_entity, intermediates, server_name, scts, ocsp_response, now)
                .map(|_| ())
                .map_err(|e| {
                    let reason = e.to_string();
                    chain_error = Some(e);
                    reason
                })
        });

        debug!(?decision, thumbprint = %sha1_thumbprint(&end_entity.0), "server certificate evaluated");
        match decision {
            TrustDecision::Rejected(RejectReason::ChainInvalid(reason)) => {
                warn!(%reason, "server certificate failed CA validation");
                Err(chain_error.unwrap_or(rustls::Error::InvalidCertificate(
                    CertificateError::UnknownIssuer,
                )))
            }
            TrustDecision::Rejected(RejectReason::ThumbprintMismatch) => {
                warn!("server certificate thumbprint does not match the pinned thumbprint");
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &Certificate,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &Certificate,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}
