// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process configuration, read once from the environment.
//!
//! Every component receives its own immutable section of [`Config`] at
//! construction time; nothing reads the environment after startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::listener::validate_socket_path;

pub const SOCKET_ENV: &str = "STATUS_UPDATER_SOCKET";
pub const MAX_PAYLOAD_BYTES_ENV: &str = "STATUS_UPDATER_MAX_PAYLOAD_BYTES";
pub const READ_TIMEOUT_ENV: &str = "STATUS_UPDATER_READ_TIMEOUT_MS";
pub const SOCKET_CHECK_INTERVAL_ENV: &str = "STATUS_UPDATER_SOCKET_CHECK_INTERVAL_MS";
pub const ETCD_ENDPOINTS_ENV: &str = "STATUS_UPDATER_ETCD_ENDPOINTS";
pub const CERT_FILE_ENV: &str = "STATUS_UPDATER_CERT_FILE";
pub const KEY_FILE_ENV: &str = "STATUS_UPDATER_KEY_FILE";
pub const CA_FILE_ENV: &str = "STATUS_UPDATER_CA_FILE";
pub const CONNECT_TIMEOUT_ENV: &str = "STATUS_UPDATER_CONNECT_TIMEOUT_MS";
pub const REQUEST_TIMEOUT_ENV: &str = "STATUS_UPDATER_REQUEST_TIMEOUT_MS";
pub const KEY_ENV: &str = "STATUS_UPDATER_KEY";
pub const KEY_TTL_ENV: &str = "STATUS_UPDATER_KEY_TTL_MS";
pub const KEY_RETRY_ENV: &str = "STATUS_UPDATER_KEY_RETRY_MS";
pub const KEY_REFRESH_ENV: &str = "STATUS_UPDATER_KEY_REFRESH_MS";

const DEFAULT_SOCKET_PATH: &str = "/tmp/socket";
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SOCKET_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_ETCD_ENDPOINT: &str = "http://127.0.0.1:2379";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_KEY: &str = "/artifact-downloader/status";
const DEFAULT_KEY_TTL: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("refresh interval ({refresh:?}) must be strictly less than the key TTL ({ttl:?})")]
    RefreshNotBelowTtl { refresh: Duration, ttl: Duration },
    #[error("key TTL must be at least one second, got {0:?}")]
    TtlTooShort(Duration),
    #[error("key name cannot be empty")]
    EmptyKey,
    #[error("at least one etcd endpoint is required")]
    NoEndpoints,
    #[error("invalid etcd endpoint {0:?}: expected an http or https URL")]
    InvalidEndpoint(String),
    #[error("STATUS_UPDATER_CERT_FILE and STATUS_UPDATER_KEY_FILE must be set together")]
    IncompleteIdentity,
    #[error("invalid socket path: {0}")]
    InvalidSocketPath(String),
}

/// Settings for the local socket the reporting process writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub socket_path: PathBuf,
    /// Payloads larger than this are dropped.
    pub max_payload_bytes: usize,
    /// A connection that does not reach EOF within this window is dropped.
    pub read_timeout: Duration,
    /// How often the socket file is checked for external removal.
    pub socket_check_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            read_timeout: DEFAULT_READ_TIMEOUT,
            socket_check_interval: DEFAULT_SOCKET_CHECK_INTERVAL,
        }
    }
}

/// Client certificate material for etcd. All paths are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    pub tls: TlsFiles,
    pub connect_timeout: Duration,
    /// Upper bound for a whole Put request, connection included.
    pub request_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ETCD_ENDPOINT.to_string()],
            tls: TlsFiles::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        for endpoint in &self.endpoints {
            match Url::parse(endpoint) {
                Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
                _ => return Err(ConfigError::InvalidEndpoint(endpoint.clone())),
            }
        }
        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            return Err(ConfigError::IncompleteIdentity);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroValue(CONNECT_TIMEOUT_ENV));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroValue(REQUEST_TIMEOUT_ENV));
        }
        Ok(())
    }
}

/// Parameters of the key refresh loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpdaterConfig {
    pub key: String,
    pub ttl: Duration,
    /// Delay before retrying a failed Put.
    pub retry_interval: Duration,
    /// Cadence of re-writing the last known value. Must stay below `ttl`.
    pub refresh_interval: Duration,
}

impl Default for KeyUpdaterConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_KEY.to_string(),
            ttl: DEFAULT_KEY_TTL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl KeyUpdaterConfig {
    /// Checks the liveness contract: the key is re-written before it can expire.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key.trim_matches('/').is_empty() {
            return Err(ConfigError::EmptyKey);
        }
        if self.ttl.is_zero() {
            return Err(ConfigError::ZeroValue(KEY_TTL_ENV));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::ZeroValue(KEY_RETRY_ENV));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroValue(KEY_REFRESH_ENV));
        }
        // etcd expresses TTLs in whole seconds
        if self.ttl < Duration::from_secs(1) {
            return Err(ConfigError::TtlTooShort(self.ttl));
        }
        if self.refresh_interval >= self.ttl {
            return Err(ConfigError::RefreshNotBelowTtl {
                refresh: self.refresh_interval,
                ttl: self.ttl,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub listener: ListenerConfig,
    pub store: StoreConfig,
    pub key_updater: KeyUpdaterConfig,
}

impl Config {
    /// Reads the configuration from the process environment and validates it.
    pub fn new() -> Result<Config, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Config::default();

        let listener = ListenerConfig {
            socket_path: var(SOCKET_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.listener.socket_path),
            max_payload_bytes: match var(MAX_PAYLOAD_BYTES_ENV) {
                Some(value) => parse_number(MAX_PAYLOAD_BYTES_ENV, &value)? as usize,
                None => defaults.listener.max_payload_bytes,
            },
            read_timeout: duration_ms(&var, READ_TIMEOUT_ENV, defaults.listener.read_timeout)?,
            socket_check_interval: duration_ms(
                &var,
                SOCKET_CHECK_INTERVAL_ENV,
                defaults.listener.socket_check_interval,
            )?,
        };

        let endpoints = match var(ETCD_ENDPOINTS_ENV) {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|endpoint| !endpoint.is_empty())
                .map(|endpoint| endpoint.trim_end_matches('/').to_string())
                .collect(),
            None => defaults.store.endpoints,
        };
        let store = StoreConfig {
            endpoints,
            tls: TlsFiles {
                cert_file: var(CERT_FILE_ENV).map(PathBuf::from),
                key_file: var(KEY_FILE_ENV).map(PathBuf::from),
                ca_file: var(CA_FILE_ENV).map(PathBuf::from),
            },
            connect_timeout: duration_ms(
                &var,
                CONNECT_TIMEOUT_ENV,
                defaults.store.connect_timeout,
            )?,
            request_timeout: duration_ms(
                &var,
                REQUEST_TIMEOUT_ENV,
                defaults.store.request_timeout,
            )?,
        };

        let key_updater = KeyUpdaterConfig {
            key: normalize_key(&var(KEY_ENV).unwrap_or(defaults.key_updater.key)),
            ttl: duration_ms(&var, KEY_TTL_ENV, defaults.key_updater.ttl)?,
            retry_interval: duration_ms(&var, KEY_RETRY_ENV, defaults.key_updater.retry_interval)?,
            refresh_interval: duration_ms(
                &var,
                KEY_REFRESH_ENV,
                defaults.key_updater.refresh_interval,
            )?,
        };

        let config = Config {
            listener,
            store,
            key_updater,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_socket_path(&self.listener.socket_path)
            .map_err(|e| ConfigError::InvalidSocketPath(e.to_string()))?;
        if self.listener.max_payload_bytes == 0 {
            return Err(ConfigError::ZeroValue(MAX_PAYLOAD_BYTES_ENV));
        }
        if self.listener.read_timeout.is_zero() {
            return Err(ConfigError::ZeroValue(READ_TIMEOUT_ENV));
        }
        if self.listener.socket_check_interval.is_zero() {
            return Err(ConfigError::ZeroValue(SOCKET_CHECK_INTERVAL_ENV));
        }
        self.store.validate()?;
        self.key_updater.validate()
    }
}

/// Ensures the key is rooted, as etcd v2 key paths are.
pub fn normalize_key(key: &str) -> String {
    let key = key.trim();
    if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{key}")
    }
}

fn parse_number(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber {
            name,
            value: value.to_string(),
        })
}

fn duration_ms<F>(lookup: &F, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => parse_number(name, &value).map(Duration::from_millis),
        None => Ok(default),
    }
}
