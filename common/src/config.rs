use std::{
    env,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    codec::{CipherScheme, LegacyIv, Secret, WireCodec},
    error::ConfigError,
    frame_stream::DEFAULT_MAX_FRAME_BYTES,
};

/// First port of the per-server port range; server `n` listens on
/// `DEFAULT_BASE_PORT + n`.
pub const DEFAULT_BASE_PORT: u16 = 31500;
/// Default bound on a blocking outbound connect
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

const ENABLED_ENV: &str = "INTERLINK_ENABLED";
const SECRET_ENV: &str = "INTERLINK_SECRET";
const BIND_ADDRESS_ENV: &str = "INTERLINK_BIND_ADDRESS";
const PORT_ENV: &str = "INTERLINK_PORT";
const SERVER_INDEX_ENV: &str = "INTERLINK_SERVER_INDEX";
const SCHEME_ENV: &str = "INTERLINK_CIPHER_SCHEME";
const LEGACY_IV_ENV: &str = "INTERLINK_LEGACY_IV";
const MAX_FRAME_ENV: &str = "INTERLINK_MAX_FRAME_BYTES";
const CONNECT_TIMEOUT_ENV: &str = "INTERLINK_CONNECT_TIMEOUT_MS";

/// Communication settings supplied by the host controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Whether the listening side should be opened
    pub enabled:            bool,
    /// Shared secret for inbound connections
    pub secret:             Secret,
    /// Interface to bind
    pub bind_address:       IpAddr,
    /// TCP port to listen on
    pub port:               u16,
    /// Cipher scheme for inbound connections
    pub scheme:             CipherScheme,
    /// Fixed IV of the legacy scheme; must match the peer's
    pub legacy_iv:          LegacyIv,
    /// Largest accepted frame ciphertext
    pub max_frame_bytes:    usize,
    /// Bound on outbound connects, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            enabled:            false,
            secret:             Secret::default(),
            bind_address:       IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port:               DEFAULT_BASE_PORT,
            scheme:             CipherScheme::default(),
            legacy_iv:          LegacyIv::default(),
            max_frame_bytes:    DEFAULT_MAX_FRAME_BYTES,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl CommConfig {
    /// Creates a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Port of the logical server with the given index
    pub fn port_for_index(index: u32) -> Result<u16, ConfigError> {
        u16::try_from(index)
            .ok()
            .and_then(|index| DEFAULT_BASE_PORT.checked_add(index))
            .ok_or(ConfigError::PortOutOfRange {
                base: DEFAULT_BASE_PORT,
                index,
            })
    }

    /// Default configuration listening on the port of server `index`
    pub fn for_server_index(index: u32) -> Result<Self, ConfigError> {
        Ok(Self::default().with_port(Self::port_for_index(index)?))
    }

    /// Reads the `INTERLINK_*` environment variables on top of the defaults.
    ///
    /// `INTERLINK_PORT` wins over `INTERLINK_SERVER_INDEX`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`CommConfig::from_env`] with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(enabled) = lookup(ENABLED_ENV) {
            config.enabled = parse_bool(ENABLED_ENV, &enabled)?;
        }
        if let Some(secret) = lookup(SECRET_ENV) {
            config.secret = Secret::new(secret);
        }
        if let Some(bind) = lookup(BIND_ADDRESS_ENV) {
            config.bind_address = parse_value(BIND_ADDRESS_ENV, &bind)?;
        }
        if let Some(port) = lookup(PORT_ENV) {
            config.port = parse_value(PORT_ENV, &port)?;
        } else if let Some(index) = lookup(SERVER_INDEX_ENV) {
            config.port = Self::port_for_index(parse_value(SERVER_INDEX_ENV, &index)?)?;
        }
        if let Some(scheme) = lookup(SCHEME_ENV) {
            config.scheme = scheme.parse()?;
        }
        if let Some(iv) = lookup(LEGACY_IV_ENV) {
            config.legacy_iv = parse_value(LEGACY_IV_ENV, &iv)?;
        }
        if let Some(max) = lookup(MAX_FRAME_ENV) {
            config.max_frame_bytes = parse_value(MAX_FRAME_ENV, &max)?;
        }
        if let Some(timeout) = lookup(CONNECT_TIMEOUT_ENV) {
            config.connect_timeout_ms = parse_value(CONNECT_TIMEOUT_ENV, &timeout)?;
        }

        Ok(config)
    }

    /// Enable or disable the listening side
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the shared secret
    pub fn with_secret<S: Into<Secret>>(mut self, secret: S) -> Self {
        self.secret = secret.into();
        self
    }

    /// Set the bind interface
    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    /// Set the listening port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the cipher scheme
    pub fn with_scheme(mut self, scheme: CipherScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Set the fixed IV used by the legacy scheme
    pub fn with_legacy_iv(mut self, legacy_iv: LegacyIv) -> Self {
        self.legacy_iv = legacy_iv;
        self
    }

    /// Set the frame size limit
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Set the outbound connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Outbound connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Socket address to bind the listener on
    pub fn bind_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Codec for this configuration's secret and wire settings
    pub fn codec(&self) -> WireCodec {
        self.codec_for(&self.secret)
    }

    /// Codec for another secret with this configuration's scheme and limit
    pub fn codec_for(&self, secret: &Secret) -> WireCodec {
        WireCodec::new(secret, self.scheme)
            .with_legacy_iv(self.legacy_iv)
            .with_max_frame_bytes(self.max_frame_bytes)
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => {
            Err(ConfigError::InvalidValue {
                key,
                value: value.to_string(),
            })
        }
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }
    })
}

/// Host (name or IP) and port of a peer controller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    /// Validates and builds a peer address
    pub fn new<H: Into<String>>(host: H, port: u16) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.trim().is_empty() || host.chars().any(char::is_whitespace) || port == 0 {
            return Err(ConfigError::InvalidPeerAddress(format!("{host}:{port}")));
        }
        Ok(Self { host, port })
    }

    /// Host name or IP literal
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for PeerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPeerAddress(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
            None if host.contains(':') => return Err(invalid()),
            None => host,
        };
        let port = port.parse().map_err(|_| invalid())?;
        Self::new(host, port).map_err(|_| invalid())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_base_port() {
        let config = CommConfig::new();
        assert!(!config.enabled);
        assert_eq!(config.port, DEFAULT_BASE_PORT);
        assert_eq!(config.scheme, CipherScheme::Legacy);
    }

    #[test]
    fn server_index_offsets_port() {
        assert_eq!(CommConfig::for_server_index(3).unwrap().port, 31503);
        assert!(CommConfig::port_for_index(40_000).is_err());
    }

    #[test]
    fn env_lookup_overrides_defaults() {
        let config = CommConfig::from_lookup(lookup(&[
            ("INTERLINK_ENABLED", "true"),
            ("INTERLINK_SECRET", "s3cret"),
            ("INTERLINK_BIND_ADDRESS", "127.0.0.1"),
            ("INTERLINK_SERVER_INDEX", "2"),
            ("INTERLINK_CIPHER_SCHEME", "hardened"),
        ]))
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.secret.expose(), "s3cret");
        assert_eq!(config.bind_socket_addr().to_string(), "127.0.0.1:31502");
        assert_eq!(config.scheme, CipherScheme::Hardened);
    }

    #[test]
    fn explicit_port_beats_server_index() {
        let config = CommConfig::from_lookup(lookup(&[
            ("INTERLINK_PORT", "40000"),
            ("INTERLINK_SERVER_INDEX", "2"),
        ]))
        .unwrap();
        assert_eq!(config.port, 40000);
    }

    #[test]
    fn bad_env_values_are_reported() {
        let err = CommConfig::from_lookup(lookup(&[("INTERLINK_ENABLED", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "INTERLINK_ENABLED", .. }));
        assert!(CommConfig::from_lookup(lookup(&[("INTERLINK_PORT", "99999")])).is_err());
    }

    #[test]
    fn legacy_iv_comes_from_env() {
        let config = CommConfig::from_lookup(lookup(&[
            ("INTERLINK_LEGACY_IV", "30313233343536373839616263646566"),
        ]))
        .unwrap();
        assert_eq!(config.legacy_iv, LegacyIv::new(*b"0123456789abcdef"));
        assert_eq!(CommConfig::new().legacy_iv, LegacyIv::default());

        let err = CommConfig::from_lookup(lookup(&[("INTERLINK_LEGACY_IV", "short")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "INTERLINK_LEGACY_IV", .. }));
    }

    #[test]
    fn codec_uses_configured_legacy_iv() {
        let shared = CommConfig::new().with_secret("iv-test");
        let moved = shared.clone().with_legacy_iv(LegacyIv::new(*b"0123456789abcdef"));
        let frame = moved.codec().encode(&serde_json::json!({ "v": 1 })).unwrap();
        let newline = frame.iter().position(|&b| b == b'\n').unwrap();

        assert!(moved.codec().decode_value(&frame[newline + 1..]).is_ok());
        assert_ne!(frame, shared.codec().encode(&serde_json::json!({ "v": 1 })).unwrap());
    }

    #[test]
    fn config_deserializes_from_partial_json() {
        let config: CommConfig =
            serde_json::from_str(r#"{ "enabled": true, "secret": "abc", "port": 31510 }"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.secret, Secret::new("abc"));
        assert_eq!(config.port, 31510);
        assert_eq!(config.connect_timeout(), Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS));
    }

    #[test]
    fn peer_address_parsing() {
        let peer: PeerAddress = "10.0.0.5:31501".parse().unwrap();
        assert_eq!((peer.host(), peer.port()), ("10.0.0.5", 31501));

        let peer: PeerAddress = "[::1]:31500".parse().unwrap();
        assert_eq!(peer.host(), "::1");
        assert_eq!(peer.to_string(), "[::1]:31500");

        for bad in ["", "host", "host:", ":31500", "host:port", "host:0", "::1:31500"] {
            assert!(bad.parse::<PeerAddress>().is_err(), "{bad} should not parse");
        }
    }
}
