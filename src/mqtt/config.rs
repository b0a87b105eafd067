//! Connection settings and credential strategy selection.
//!
//! Settings are resolved from the parsed command set, optionally seeded
//! by a TOML settings file for values the command line left unset.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cli::registry::{
    CMD_CA_FILE, CMD_CERT, CMD_CLIENT_ID, CMD_ENDPOINT, CMD_KEY, CMD_PKCS11_KEY, CMD_PKCS11_LIB,
    CMD_PKCS11_PIN, CMD_PKCS11_SLOT, CMD_PKCS11_TOKEN, CMD_PORT, CMD_PROXY_HOST, CMD_PROXY_PORT,
    CMD_SIGNING_REGION,
};
use crate::cli::CommandRegistry;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {0}: {1}")]
    FileRead(PathBuf, String),

    #[error("Failed to parse settings file {0}: {1}")]
    FileParse(PathBuf, String),

    #[error("Invalid port value: {0}")]
    InvalidPort(i64),
}

/// HTTP proxy to tunnel the connection through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
}

/// Parameters for a private key held in a PKCS#11 token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkcs11Options {
    pub lib: PathBuf,
    pub user_pin: String,
    pub token_label: Option<String>,
    pub slot_id: Option<u64>,
    pub key_label: Option<String>,
    pub cert: PathBuf,
}

/// Everything needed to open a broker connection.
///
/// `port: None` means auto-selection by the chosen strategy. `ca_file:
/// None` falls back to the system trust bundle.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoint: String,
    pub port: Option<u16>,
    pub client_id: String,
    pub ca_file: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub proxy: Option<ProxySettings>,
    pub signing_region: Option<String>,
    pub keep_alive: Duration,
    pub persistent_session: bool,
}

impl ConnectionSettings {
    /// Resolves settings from the parsed command set, seeded by an
    /// optional settings file.
    ///
    /// Precedence: command line, then file, then registered defaults. A
    /// missing endpoint is fatal and reported through the registry's
    /// help output. Certificate and key are demanded later, by the
    /// strategy that actually needs them.
    pub fn resolve(
        registry: &CommandRegistry,
        file: Option<&FileConfig>,
    ) -> Result<Self, SettingsError> {
        let connection = file.map(|f| &f.connection);

        let endpoint = pick_text(registry, CMD_ENDPOINT, connection.and_then(|c| c.endpoint.clone()))
            .unwrap_or_else(|| registry.exit_missing(CMD_ENDPOINT));

        let port = match pick_integer(registry, CMD_PORT, connection.and_then(|c| c.port.map(i64::from)))
        {
            Some(raw) => Some(u16::try_from(raw).map_err(|_| SettingsError::InvalidPort(raw))?),
            None => None,
        };

        let proxy_host = pick_text(
            registry,
            CMD_PROXY_HOST,
            connection.and_then(|c| c.proxy_host.clone()),
        );
        let proxy_port = pick_integer(
            registry,
            CMD_PROXY_PORT,
            connection.and_then(|c| c.proxy_port.map(i64::from)),
        );
        let proxy = match (proxy_host, proxy_port) {
            (Some(host), Some(raw)) => Some(ProxySettings {
                host,
                port: u16::try_from(raw).map_err(|_| SettingsError::InvalidPort(raw))?,
            }),
            _ => None,
        };

        Ok(Self {
            endpoint,
            port,
            client_id: pick_text(
                registry,
                CMD_CLIENT_ID,
                connection.and_then(|c| c.client_id.clone()),
            )
            .unwrap_or_else(|| registry.exit_missing(CMD_CLIENT_ID)),
            ca_file: pick_text(registry, CMD_CA_FILE, connection.and_then(|c| c.ca_file.clone()))
                .map(PathBuf::from),
            cert: pick_text(registry, CMD_CERT, connection.and_then(|c| c.cert.clone()))
                .map(PathBuf::from),
            key: pick_text(registry, CMD_KEY, connection.and_then(|c| c.key.clone()))
                .map(PathBuf::from),
            proxy,
            signing_region: pick_text(
                registry,
                CMD_SIGNING_REGION,
                connection.and_then(|c| c.signing_region.clone()),
            ),
            keep_alive: Duration::from_secs(30),
            persistent_session: true,
        })
    }

    /// Packages the PKCS#11 commands, insisting on the ones the token
    /// cannot be used without.
    pub fn pkcs11_options(registry: &CommandRegistry) -> Pkcs11Options {
        Pkcs11Options {
            lib: PathBuf::from(registry.required_text(CMD_PKCS11_LIB)),
            user_pin: registry.required_text(CMD_PKCS11_PIN),
            token_label: registry.text(CMD_PKCS11_TOKEN),
            slot_id: registry
                .integer(CMD_PKCS11_SLOT)
                .and_then(|raw| u64::try_from(raw).ok()),
            key_label: registry.text(CMD_PKCS11_KEY),
            cert: PathBuf::from(registry.required_text(CMD_CERT)),
        }
    }
}

/// The three mutually exclusive ways to authenticate a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialStrategy {
    /// X.509 client certificate and key read from PEM files.
    DirectMtls,
    /// TLS websocket with request signing for the given region.
    WebsocketSigning { region: String },
    /// Client key held in a PKCS#11 token; chosen only through its own
    /// entry point, never by [`select`](Self::select).
    Pkcs11,
}

impl CredentialStrategy {
    /// A signing-region value selects websocket signing, otherwise the
    /// connection uses direct mutual TLS.
    pub fn select(settings: &ConnectionSettings) -> Self {
        match &settings.signing_region {
            Some(region) => Self::WebsocketSigning {
                region: region.clone(),
            },
            None => Self::DirectMtls,
        }
    }
}

/// Optional TOML settings file seeding connection values.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub connection: FileConnection,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct FileConnection {
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub client_id: Option<String>,
    pub ca_file: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub signing_region: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::FileRead(path.to_path_buf(), e.to_string()))?;
        toml::from_str(&raw).map_err(|e| SettingsError::FileParse(path.to_path_buf(), e.to_string()))
    }

    /// Default location under the platform configuration directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("iotprobe").join("connection.toml"))
    }

    /// Loads the file at `path` when it exists; a broken file is logged
    /// and skipped rather than aborting startup.
    pub fn load_if_present(path: &Path) -> Option<Self> {
        if !path.exists() {
            debug!("No settings file at {}", path.display());
            return None;
        }
        match Self::load(path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring settings file: {}", e);
                None
            }
        }
    }
}

fn pick_text(registry: &CommandRegistry, name: &str, file_value: Option<String>) -> Option<String> {
    if registry.provided(name) {
        return registry.text(name);
    }
    file_value.or_else(|| registry.text(name))
}

fn pick_integer(registry: &CommandRegistry, name: &str, file_value: Option<i64>) -> Option<i64> {
    if registry.provided(name) {
        return registry.integer(name);
    }
    file_value.or_else(|| registry.integer(name))
}
