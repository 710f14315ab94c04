use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

use crate::errors::TrapperError;

pub const DEFAULT_PORT: u16 = 10051;

/// TLS versions offered during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsProtocols {
    /// Let the TLS stack negotiate the best version it supports.
    #[default]
    SystemDefault,
    Tls12,
    Tls13,
}

impl TlsProtocols {
    const TLS12_FLAG: i64 = 0x0C00;
    const TLS13_FLAG: i64 = 0x3000;

    /// Map a numeric protocol bitmask as stored by older configuration files.
    /// Zero means "let the system choose". Flags for TLS versions below 1.2
    /// are ignored; a mask selecting neither 1.2 nor 1.3 is rejected.
    pub fn from_flags(flags: i64) -> Option<Self> {
        if flags == 0 {
            return Some(Self::SystemDefault);
        }
        match (flags & Self::TLS12_FLAG != 0, flags & Self::TLS13_FLAG != 0) {
            (true, true) => Some(Self::SystemDefault),
            (true, false) => Some(Self::Tls12),
            (false, true) => Some(Self::Tls13),
            (false, false) => None,
        }
    }
}

/// Root directory a client certificate store lives under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreLocation {
    #[default]
    CurrentUser,
    LocalMachine,
}

impl StoreLocation {
    /// Zero is what an unset location serializes as.
    pub fn from_number(value: i64) -> Option<Self> {
        match value {
            0 | 1 => Some(Self::CurrentUser),
            2 => Some(Self::LocalMachine),
            _ => None,
        }
    }
}

/// Store directory names by their numeric identifier. Zero is what an unset
/// store name serializes as and maps to the personal store.
fn store_name_from_number(value: i64) -> Option<&'static str> {
    let name = match value {
        0 | 5 => "My",
        1 => "AddressBook",
        2 => "AuthRoot",
        3 => "CertificateAuthority",
        4 => "Disallowed",
        6 => "Root",
        7 => "TrustedPeople",
        8 => "TrustedPublisher",
        _ => return None,
    };
    Some(name)
}

/// Enum-like settings are written by name, but older files store them as
/// numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum NamedOrNumeric<T> {
    Named(T),
    Numeric(i64),
}

fn named_or_numeric<'de, D, T>(
    deserializer: D,
    setting: &str,
    from_number: fn(i64) -> Option<T>,
) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    match NamedOrNumeric::<T>::deserialize(deserializer)? {
        NamedOrNumeric::Named(value) => Ok(value),
        NamedOrNumeric::Numeric(n) => {
            from_number(n).ok_or_else(|| D::Error::custom(format!("unsupported {setting} value {n}")))
        }
    }
}

fn deserialize_tls_protocols<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TlsProtocols, D::Error> {
    named_or_numeric(deserializer, "SslProtocols", TlsProtocols::from_flags)
}

fn deserialize_store_location<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<StoreLocation, D::Error> {
    named_or_numeric(deserializer, "ClientCertificateStoreLocation", StoreLocation::from_number)
}

fn deserialize_store_name<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    named_or_numeric(deserializer, "ClientCertificateStoreName", |n| {
        store_name_from_number(n).map(str::to_string)
    })
}

/// Connection, TLS and certificate-trust settings for the sender.
///
/// Persisted as a flat JSON object. Built once, then shared read-only behind
/// an `Arc` by the sender and transport.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SenderConfig {
    pub server_address: String,
    pub port: u16,
    pub host_name: String,
    pub use_encryption: bool,
    pub target_host: String,
    pub server_certificate_thumbprint: Option<String>,
    pub server_certificate_path: Option<PathBuf>,
    pub client_certificate_thumbprint: Option<String>,
    #[serde(deserialize_with = "deserialize_store_name")]
    pub client_certificate_store_name: String,
    #[serde(deserialize_with = "deserialize_store_location")]
    pub client_certificate_store_location: StoreLocation,
    pub client_certificate_path: Option<PathBuf>,
    /// PEM private key for `client_certificate_path`, when not bundled in it.
    pub client_certificate_key_path: Option<PathBuf>,
    #[serde(serialize_with = "serialize_password")]
    pub client_certificate_password: Option<SecretString>,
    /// Extra PEM trust anchors used alongside the bundled Mozilla roots.
    pub ca_certificate_path: Option<PathBuf>,
    #[serde(rename = "SslProtocols", deserialize_with = "deserialize_tls_protocols")]
    pub tls_protocols: TlsProtocols,
    #[serde(rename = "PinCertificateBeforeCA")]
    pub pin_certificate_before_ca: bool,
    #[serde(rename = "PinCertificateAfterCA")]
    pub pin_certificate_after_ca: bool,
    pub debug: bool,
    pub log_file_path: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost".to_string(),
            port: DEFAULT_PORT,
            host_name: String::new(),
            use_encryption: false,
            target_host: "localhost".to_string(),
            server_certificate_thumbprint: None,
            server_certificate_path: None,
            client_certificate_thumbprint: None,
            client_certificate_store_name: "My".to_string(),
            client_certificate_store_location: StoreLocation::default(),
            client_certificate_path: None,
            client_certificate_key_path: None,
            client_certificate_password: None,
            ca_certificate_path: None,
            tls_protocols: TlsProtocols::default(),
            pin_certificate_before_ca: false,
            pin_certificate_after_ca: false,
            debug: false,
            log_file_path: None,
            connect_timeout_secs: 10,
            io_timeout_secs: 10,
        }
    }
}

fn serialize_password<S: Serializer>(
    password: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match password {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

/// Treat empty or whitespace-only strings as unset.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl SenderConfig {
    pub fn new(server_address: impl Into<String>, port: u16, host_name: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            port,
            host_name: host_name.into(),
            ..Self::default()
        }
    }

    /// Load settings from `path`.
    ///
    /// A missing file is created with defaults. A file that cannot be read or
    /// parsed is left alone and defaults are used instead.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, TrapperError> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            info!(path = %path.display(), "wrote default sender configuration");
            return Ok(config);
        }

        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "configuration unreadable; using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrapperError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TrapperError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn server_thumbprint(&self) -> Option<&str> {
        non_empty(&self.server_certificate_thumbprint)
    }

    pub fn client_thumbprint(&self) -> Option<&str> {
        non_empty(&self.client_certificate_thumbprint)
    }

    /// Check the settings needed before the first send.
    pub fn validate(&self) -> Result<(), TrapperError> {
        if self.host_name.trim().is_empty() {
            return Err(TrapperError::MissingHostName);
        }
        if self.server_address.trim().is_empty() {
            return Err(TrapperError::Config("server address is empty".into()));
        }
        if self.port == 0 {
            return Err(TrapperError::Config("port must be non-zero".into()));
        }
        if self.connect_timeout_secs == 0 || self.io_timeout_secs == 0 {
            return Err(TrapperError::Config("timeouts must be non-zero".into()));
        }

        if self.use_encryption {
            if self.target_host.trim().is_empty() {
                return Err(TrapperError::Config("target host is required for TLS".into()));
            }
            if self.pin_certificate_after_ca && self.server_thumbprint().is_none() {
                return Err(TrapperError::Config(
                    "pinning after CA validation requires a server certificate thumbprint".into(),
                ));
            }
            if self.pin_certificate_before_ca
                && self.server_thumbprint().is_none()
                && self.server_certificate_path.is_none()
            {
                warn!("pinning before CA is enabled but no server thumbprint or certificate is configured");
            }
            if self.pin_certificate_before_ca && self.pin_certificate_after_ca {
                warn!("both pin-before-CA and pin-after-CA are set; a pinned match skips CA validation");
            }
        }
        Ok(())
    }
}
