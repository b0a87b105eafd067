//! Packaging connection settings into `rumqttc` options.
//!
//! The builder turns [`ConnectionSettings`] into `MqttOptions` plus a
//! TLS or websocket transport and hands off to `rumqttc`, which performs
//! the handshake and session negotiation. Nothing protocol-level is
//! implemented here.

use std::fs;
use std::path::{Path, PathBuf};

use rumqttc::{
    AsyncClient, EventLoop, MqttOptions, Proxy, ProxyAuth, ProxyType, TlsConfiguration, Transport,
};
use thiserror::Error;
use tracing::{debug, info};

use super::config::{ConnectionSettings, CredentialStrategy, Pkcs11Options};

/// Root bundle used when no `--ca_file` is given.
pub const SYSTEM_CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

/// ALPN protocol that moves MQTT onto port 443.
const ALPN_MQTT: &[u8] = b"x-amzn-mqtt-ca";

const DEFAULT_MTLS_PORT: u16 = 8883;
const WEBSOCKET_PORT: u16 = 443;

/// Request capacity of the client's command channel.
const CLIENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to read credential file {0}: {1}")]
    CredentialFile(PathBuf, String),

    #[error("Missing credential material: --{0} is required for this connection")]
    MissingCredential(&'static str),

    #[error("PKCS#11 configuration error: {0}")]
    Pkcs11(String),
}

/// Builds a client handle and event loop from resolved settings.
pub struct ConnectionBuilder {
    settings: ConnectionSettings,
}

impl ConnectionBuilder {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }

    /// Selects between websocket signing and direct mutual TLS and
    /// builds the connection. PKCS#11 credentials go through
    /// [`pkcs11_mtls`](Self::pkcs11_mtls) instead.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), ConnectionError> {
        match CredentialStrategy::select(&self.settings) {
            CredentialStrategy::WebsocketSigning { region } => self.websocket_signing(&region),
            _ => self.direct_mtls(),
        }
    }

    /// Mutual TLS with certificate and key read from PEM files.
    ///
    /// The port auto-selects 8883; port 443 adds the ALPN protocol the
    /// broker expects for MQTT on the HTTPS port.
    pub fn direct_mtls(self) -> Result<(AsyncClient, EventLoop), ConnectionError> {
        let cert_path = self
            .settings
            .cert
            .as_deref()
            .ok_or(ConnectionError::MissingCredential("cert"))?;
        let key_path = self
            .settings
            .key
            .as_deref()
            .ok_or(ConnectionError::MissingCredential("key"))?;

        let ca = self.read_ca()?;
        let cert = read_credential(cert_path)?;
        let key = read_credential(key_path)?;

        let port = select_mtls_port(self.settings.port);
        let tls = TlsConfiguration::Simple {
            ca,
            alpn: alpn_for_port(port),
            client_auth: Some((cert, key)),
        };

        debug!(
            "Direct mTLS to {}:{} (cert: {})",
            self.settings.endpoint,
            port,
            cert_path.display()
        );
        let mut options = self.base_options(self.settings.endpoint.clone(), port);
        options.set_transport(Transport::Tls(tls));
        Ok(AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY))
    }

    /// TLS websocket on port 443.
    ///
    /// The signing region picked this strategy; signing the upgrade
    /// request itself is the transport layer's concern.
    pub fn websocket_signing(self, region: &str) -> Result<(AsyncClient, EventLoop), ConnectionError> {
        let ca = self.read_ca()?;
        let url = websocket_url(&self.settings.endpoint);

        info!("Websocket connection via {} (region {})", url, region);
        let mut options = self.base_options(url, WEBSOCKET_PORT);
        options.set_transport(Transport::Wss(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
        Ok(AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY))
    }

    /// Mutual TLS with the private key held in a PKCS#11 token.
    ///
    /// Validates and packages the token parameters, then refuses: the
    /// rustls transport consumes raw key material and cannot drive a
    /// PKCS#11 module. File-based credentials (`--cert`/`--key`) are the
    /// supported path.
    pub fn pkcs11_mtls(
        self,
        options: &Pkcs11Options,
    ) -> Result<(AsyncClient, EventLoop), ConnectionError> {
        info!("Loading PKCS#11 library '{}' ...", options.lib.display());
        if !options.lib.exists() {
            return Err(ConnectionError::CredentialFile(
                options.lib.clone(),
                "no such file".to_string(),
            ));
        }
        if options.user_pin.is_empty() {
            return Err(ConnectionError::Pkcs11("empty user PIN".to_string()));
        }
        // Resolve the certificate now so a bad path is reported as such
        // rather than blamed on the token.
        read_credential(&options.cert)?;

        let token = options
            .token_label
            .clone()
            .or_else(|| options.slot_id.map(|slot| format!("slot {slot}")))
            .unwrap_or_else(|| "default token".to_string());
        Err(ConnectionError::Pkcs11(format!(
            "key in {token} cannot be used by the TLS transport; supply file-based credentials \
             via --cert and --key"
        )))
    }

    fn base_options(&self, host: String, port: u16) -> MqttOptions {
        let mut options = MqttOptions::new(self.settings.client_id.clone(), host, port);
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(!self.settings.persistent_session);
        if let Some(proxy) = &self.settings.proxy {
            debug!("Tunneling through http proxy {}:{}", proxy.host, proxy.port);
            options.set_proxy(Proxy {
                ty: ProxyType::Http,
                auth: ProxyAuth::None,
                addr: proxy.host.clone(),
                port: proxy.port,
            });
        }
        options
    }

    fn read_ca(&self) -> Result<Vec<u8>, ConnectionError> {
        let path = self
            .settings
            .ca_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(SYSTEM_CA_BUNDLE));
        read_credential(&path)
    }
}

fn read_credential(path: &Path) -> Result<Vec<u8>, ConnectionError> {
    fs::read(path).map_err(|e| ConnectionError::CredentialFile(path.to_path_buf(), e.to_string()))
}

fn select_mtls_port(requested: Option<u16>) -> u16 {
    requested.unwrap_or(DEFAULT_MTLS_PORT)
}

fn alpn_for_port(port: u16) -> Option<Vec<Vec<u8>>> {
    (port == WEBSOCKET_PORT).then(|| vec![ALPN_MQTT.to_vec()])
}

fn websocket_url(endpoint: &str) -> String {
    format!("wss://{endpoint}/mqtt")
}
