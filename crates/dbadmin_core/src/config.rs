//! Connection settings and the configuration collaborator they are read from.

use crate::error::{DbError, DbResult};
use crate::tls::{TlsConfigError, TlsMaterial};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Production dial string.
pub const KEY_DIAL: &str = "CLOUDSQL";
/// Dial string used when connecting from outside the hosting environment.
pub const KEY_DIAL_LOCAL: &str = "CLOUDSQL_LOCAL";
/// CA bundle used to verify the server.
pub const KEY_SERVER_CA: &str = "TLS_SERVER_CA";
/// Client certificate presented to the server.
pub const KEY_CLIENT_CERT: &str = "TLS_CLIENT_CERT";
/// Client private key.
pub const KEY_CLIENT_KEY: &str = "TLS_CLIENT_KEY";
/// Whether local connections configure mutual TLS themselves.
pub const KEY_USE_TLS: &str = "DB_USE_TLS";
/// Hostname verification for TLS connections.
pub const KEY_VERIFY_HOSTNAME: &str = "TLS_VERIFY_HOSTNAME";
/// Upper bound on pooled connections.
pub const KEY_MAX_POOL_SIZE: &str = "DB_MAX_POOL_SIZE";
/// Dial timeout in seconds.
pub const KEY_CONNECT_TIMEOUT: &str = "DB_CONNECT_TIMEOUT_SECS";
/// Pool checkout timeout in seconds.
pub const KEY_WAIT_TIMEOUT: &str = "DB_WAIT_TIMEOUT_SECS";
/// Route queries through the manager's statement cache.
pub const KEY_EXPLICIT_PREPARE: &str = "DB_EXPLICIT_PREPARE";

/// Default pool size.
pub const DEFAULT_MAX_POOL_SIZE: usize = 20;

/// Named settings provided by the embedding application.
pub trait ConfigSource {
    /// Raw string value for `key`, if set.
    fn get_string(&self, key: &str) -> Option<String>;

    /// Integer value for `key`. Malformed values are a config error.
    fn get_int(&self, key: &str) -> DbResult<Option<i64>> {
        match self.get_string(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| DbError::config(format!("{key} must be an integer, got {raw:?}"))),
        }
    }

    /// Boolean value for `key`. Accepts true/false, 1/0, yes/no, on/off.
    fn get_bool(&self, key: &str) -> DbResult<Option<bool>> {
        match self.get_string(key) {
            None => Ok(None),
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Some(true)),
                "false" | "0" | "no" | "off" => Ok(Some(false)),
                _ => Err(DbError::config(format!("{key} must be a boolean, got {raw:?}"))),
            },
        }
    }
}

/// Reads settings from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    prefix: String,
}

impl EnvConfig {
    /// Read unprefixed variables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read variables named `{prefix}{key}`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl ConfigSource for EnvConfig {
    fn get_string(&self, key: &str) -> Option<String> {
        std::env::var(format!("{}{}", self.prefix, key)).ok()
    }
}

/// In-memory settings.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    values: HashMap<String, String>,
}

impl MapConfig {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(key.into(), value.to_string());
        self
    }

    /// Load a flat JSON object of strings, numbers and booleans.
    pub fn from_json(json: &str) -> DbResult<Self> {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)
            .map_err(|e| DbError::config(format!("invalid settings JSON: {e}")))?;

        let mut values = HashMap::with_capacity(object.len());
        for (key, value) in object {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null => continue,
                other => {
                    return Err(DbError::config(format!("{key} must be a scalar, got {other}")))
                }
            };
            values.insert(key, value);
        }
        Ok(Self { values })
    }
}

impl ConfigSource for MapConfig {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Everything the connection manager needs to dial the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Dial string used from inside the hosting environment.
    pub dial_string: String,
    /// Dial string used from outside (local development).
    pub local_dial_string: String,
    /// Whether local connections configure mutual TLS themselves.
    pub use_tls: bool,
    /// CA bundle used to verify the server.
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate.
    pub client_cert_path: Option<PathBuf>,
    /// Client private key (PKCS#8).
    pub client_key_path: Option<PathBuf>,
    /// Whether the server certificate must match the dialed host name.
    pub verify_hostname: bool,
    /// Maximum pooled connections.
    pub max_pool_size: usize,
    /// Dial timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Pool checkout timeout in seconds.
    pub wait_timeout_secs: u64,
    /// Prepare statements once through the manager's cache instead of per call.
    pub explicit_prepare: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            dial_string: String::new(),
            local_dial_string: String::new(),
            use_tls: true,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            verify_hostname: true,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            connect_timeout_secs: 10,
            wait_timeout_secs: 30,
            explicit_prepare: false,
        }
    }
}

impl ConnectionSettings {
    /// Create settings with the same dial string for both localities.
    pub fn new(dial_string: impl Into<String>) -> Self {
        let dial_string = dial_string.into();
        Self { local_dial_string: dial_string.clone(), dial_string, ..Self::default() }
    }

    /// Read settings once from a configuration source.
    pub fn from_source(source: &dyn ConfigSource) -> DbResult<Self> {
        let defaults = Self::default();
        let max_pool_size = match source.get_int(KEY_MAX_POOL_SIZE)? {
            Some(n) if n > 0 => n as usize,
            Some(n) => return Err(DbError::config(format!("{KEY_MAX_POOL_SIZE} must be positive, got {n}"))),
            None => defaults.max_pool_size,
        };
        let seconds = |key: &str, default: u64| -> DbResult<u64> {
            match source.get_int(key)? {
                Some(n) if n > 0 => Ok(n as u64),
                Some(n) => Err(DbError::config(format!("{key} must be positive, got {n}"))),
                None => Ok(default),
            }
        };

        let settings = Self {
            dial_string: source.get_string(KEY_DIAL).unwrap_or_default(),
            local_dial_string: source.get_string(KEY_DIAL_LOCAL).unwrap_or_default(),
            use_tls: source.get_bool(KEY_USE_TLS)?.unwrap_or(defaults.use_tls),
            ca_cert_path: source.get_string(KEY_SERVER_CA).map(PathBuf::from),
            client_cert_path: source.get_string(KEY_CLIENT_CERT).map(PathBuf::from),
            client_key_path: source.get_string(KEY_CLIENT_KEY).map(PathBuf::from),
            verify_hostname: source.get_bool(KEY_VERIFY_HOSTNAME)?.unwrap_or(defaults.verify_hostname),
            max_pool_size,
            connect_timeout_secs: seconds(KEY_CONNECT_TIMEOUT, defaults.connect_timeout_secs)?,
            wait_timeout_secs: seconds(KEY_WAIT_TIMEOUT, defaults.wait_timeout_secs)?,
            explicit_prepare: source.get_bool(KEY_EXPLICIT_PREPARE)?.unwrap_or(defaults.explicit_prepare),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check invariants that do not depend on locality.
    pub fn validate(&self) -> DbResult<()> {
        if self.max_pool_size == 0 {
            return Err(DbError::config("max_pool_size must be greater than zero"));
        }
        if self.connect_timeout_secs == 0 || self.wait_timeout_secs == 0 {
            return Err(DbError::config("timeouts must be greater than zero"));
        }
        Ok(())
    }

    /// Set TLS material paths.
    pub fn with_tls(
        mut self,
        ca_cert_path: impl Into<PathBuf>,
        client_cert_path: impl Into<PathBuf>,
        client_key_path: impl Into<PathBuf>,
    ) -> Self {
        self.use_tls = true;
        self.ca_cert_path = Some(ca_cert_path.into());
        self.client_cert_path = Some(client_cert_path.into());
        self.client_key_path = Some(client_key_path.into());
        self
    }

    /// Disable self-configured TLS for local connections.
    pub fn without_tls(mut self) -> Self {
        self.use_tls = false;
        self
    }

    /// Set the pool size.
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Enable or disable the explicit statement cache path.
    pub fn with_explicit_prepare(mut self, explicit: bool) -> Self {
        self.explicit_prepare = explicit;
        self
    }

    /// Dial string for the given locality.
    pub fn dial_string_for(&self, local: bool) -> &str {
        if local {
            &self.local_dial_string
        } else {
            &self.dial_string
        }
    }

    /// Whether a connection with the given locality configures TLS itself.
    pub fn tls_enabled(&self, local: bool) -> bool {
        local && self.use_tls
    }

    /// TLS material, failing if any path is unset.
    pub fn tls_material(&self) -> Result<TlsMaterial, TlsConfigError> {
        let ca = self.ca_cert_path.clone().ok_or(TlsConfigError::missing("CA certificate"))?;
        let cert = self
            .client_cert_path
            .clone()
            .ok_or(TlsConfigError::missing("client certificate"))?;
        let key = self.client_key_path.clone().ok_or(TlsConfigError::missing("client key"))?;
        Ok(TlsMaterial::new(ca, cert, key).with_verify_hostname(self.verify_hostname))
    }

    /// Dial timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Pool checkout timeout.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Strip credentials from a dial string before it is logged.
///
/// URL (`scheme://user:pw@host/db`) and DSN (`user:pw@tcp(host)/db`) strings keep only
/// the part from the last `@` onward. Key/value strings (`host=db password=...`) keep
/// every pair but have the `password` value masked, whatever characters the other values
/// contain. A `password` query parameter is masked in every form.
pub fn redact_dial_string(dial: &str) -> String {
    let dial = dial.trim();
    if is_key_value(dial) {
        return mask_key_value_password(dial);
    }
    match dial.rfind('@') {
        Some(at) => mask_query_password(&dial[at..]),
        None => mask_query_password(dial),
    }
}

/// Key/value strings open with a bare `key=`; URL and DSN forms never do.
fn is_key_value(dial: &str) -> bool {
    if dial.contains("://") {
        return false;
    }
    match dial.split_once('=') {
        Some((key, _)) => !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
        None => false,
    }
}

fn mask_key_value_password(dial: &str) -> String {
    let mut pairs = Vec::new();
    let mut tokens = dial.split_whitespace();
    while let Some(token) = tokens.next() {
        match token.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case("password") => {
                pairs.push(format!("{key}=***"));
                // a quoted value may span several tokens
                if let Some(quoted) = value.strip_prefix('\'') {
                    if !ends_quote(quoted) {
                        for rest in tokens.by_ref() {
                            if ends_quote(rest) {
                                break;
                            }
                        }
                    }
                }
            }
            _ => pairs.push(token.to_string()),
        }
    }
    pairs.join(" ")
}

fn ends_quote(s: &str) -> bool {
    s.ends_with('\'') && !s.ends_with("\\'")
}

fn mask_query_password(s: &str) -> String {
    let Some((base, query)) = s.split_once('?') else {
        return s.to_string();
    };
    let query = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key.eq_ignore_ascii_case("password") => format!("{key}=***"),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{query}")
}
