//! Environment-based configuration.
//!
//! Every option is read from `TXGATE_*` environment variables (with `.env`
//! loaded by the entrypoint first). Typed sections are built through
//! `from_env` constructors so a misconfigured process fails at startup, not
//! on the first request.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use serde::{Deserialize, Serialize};

pub const ENV_PUBLIC_IFACE: &str = "TXGATE_PUBLIC_IFACE";
pub const ENV_PUBLIC_PORT: &str = "TXGATE_PUBLIC_PORT";
pub const ENV_PRIVATE_IFACE: &str = "TXGATE_PRIVATE_IFACE";
pub const ENV_PRIVATE_PORT: &str = "TXGATE_PRIVATE_PORT";

pub const ENV_BACKEND_URL: &str = "TXGATE_BACKEND_URL";
pub const ENV_BACKEND_PRIVATE_KEYS: &str = "TXGATE_BACKEND_PRIVATE_KEYS";
pub const ENV_BACKEND_CONNS: &str = "TXGATE_BACKEND_CONNS";

pub const ENV_MAILBOX_PROVIDER: &str = "TXGATE_MAILBOX_PROVIDER";
pub const ENV_MAILBOX_ADDR: &str = "TXGATE_MAILBOX_ADDR";
pub const ENV_MAILBOX_ADDRS: &str = "TXGATE_MAILBOX_ADDRS";

pub const ENV_AUTH_PROVIDER: &str = "TXGATE_AUTH_PROVIDER";

pub const ENV_CALLBACK_WALLET_OUT_OF_FUNDS_ENABLED: &str =
    "TXGATE_CALLBACK_WALLET_OUT_OF_FUNDS_ENABLED";
pub const ENV_CALLBACK_WALLET_OUT_OF_FUNDS_METHOD: &str =
    "TXGATE_CALLBACK_WALLET_OUT_OF_FUNDS_METHOD";
pub const ENV_CALLBACK_WALLET_OUT_OF_FUNDS_URL: &str = "TXGATE_CALLBACK_WALLET_OUT_OF_FUNDS_URL";
pub const ENV_CALLBACK_WALLET_OUT_OF_FUNDS_BODY: &str = "TXGATE_CALLBACK_WALLET_OUT_OF_FUNDS_BODY";
pub const ENV_CALLBACK_WALLET_OUT_OF_FUNDS_HEADERS: &str =
    "TXGATE_CALLBACK_WALLET_OUT_OF_FUNDS_HEADERS";
pub const ENV_CALLBACK_WALLET_OUT_OF_FUNDS_PERIOD_MS: &str =
    "TXGATE_CALLBACK_WALLET_OUT_OF_FUNDS_PERIOD_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("env {0} not set")]
    Missing(&'static str),
    #[error("env {key} has invalid value: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn optional(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("failed to parse {raw:?}"),
        }),
    }
}

/// One HTTP listener (the gateway binds a public and a private one).
#[derive(Debug, Clone)]
pub struct BindConfig {
    pub interface: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub tls_certificate_path: Option<String>,
    pub tls_private_key_path: Option<String>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_header_bytes: usize,
}

impl BindConfig {
    fn from_env(
        iface_key: &'static str,
        port_key: &'static str,
        default_port: u16,
    ) -> Result<Self, ConfigError> {
        // The TLS and limit knobs share one env prefix per listener, derived
        // from the interface key, e.g. TXGATE_PUBLIC_TLS_CERT.
        let prefix = iface_key.trim_end_matches("_IFACE");
        let lookup = |suffix: &str| {
            env::var(format!("{prefix}_{suffix}"))
                .ok()
                .filter(|value| !value.trim().is_empty())
        };

        let tls_certificate_path = lookup("TLS_CERT");
        let tls_private_key_path = lookup("TLS_KEY");
        let tls_enabled = lookup("TLS_ENABLED")
            .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if tls_enabled && (tls_certificate_path.is_none() || tls_private_key_path.is_none()) {
            return Err(ConfigError::Invalid {
                key: iface_key,
                reason: "TLS enabled without certificate and key paths".to_string(),
            });
        }

        let read_timeout_ms = lookup("READ_TIMEOUT_MS")
            .map(|raw| raw.parse::<u64>())
            .transpose()
            .map_err(|err| ConfigError::Invalid {
                key: iface_key,
                reason: format!("bad read timeout: {err}"),
            })?
            .unwrap_or(10_000);
        let write_timeout_ms = lookup("WRITE_TIMEOUT_MS")
            .map(|raw| raw.parse::<u64>())
            .transpose()
            .map_err(|err| ConfigError::Invalid {
                key: iface_key,
                reason: format!("bad write timeout: {err}"),
            })?
            .unwrap_or(10_000);
        let max_header_bytes = lookup("MAX_HEADER_BYTES")
            .map(|raw| raw.parse::<usize>())
            .transpose()
            .map_err(|err| ConfigError::Invalid {
                key: iface_key,
                reason: format!("bad max header bytes: {err}"),
            })?
            .unwrap_or(10_000);

        Ok(BindConfig {
            interface: optional(iface_key).unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(port_key, default_port)?,
            tls_enabled,
            tls_certificate_path,
            tls_private_key_path,
            read_timeout: Duration::from_millis(read_timeout_ms),
            write_timeout: Duration::from_millis(write_timeout_ms),
            max_header_bytes,
        })
    }
}

/// Connection to the chain backend: one WebSocket RPC endpoint and the
/// server-held signing keys.
#[derive(Clone)]
pub struct BackendConfig {
    pub url: String,
    pub private_keys: Vec<PrivateKeySigner>,
    /// Number of pooled RPC connections.
    pub conns: usize,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keys never reach logs; Debug is derived everywhere else in config.
        f.debug_struct("BackendConfig")
            .field("url", &self.url)
            .field("private_keys", &self.private_keys.len())
            .field("conns", &self.conns)
            .finish()
    }
}

impl BackendConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw_keys = required(ENV_BACKEND_PRIVATE_KEYS)?;
        let private_keys = raw_keys
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(PrivateKeySigner::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| ConfigError::Invalid {
                key: ENV_BACKEND_PRIVATE_KEYS,
                reason: err.to_string(),
            })?;
        if private_keys.is_empty() {
            return Err(ConfigError::Invalid {
                key: ENV_BACKEND_PRIVATE_KEYS,
                reason: "no private keys provided".to_string(),
            });
        }

        Ok(BackendConfig {
            url: required(ENV_BACKEND_URL)?,
            private_keys,
            conns: parse_or(ENV_BACKEND_CONNS, 4)?,
        })
    }
}

/// Which mailbox implementation stores subscription events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailboxProvider {
    #[serde(rename = "mem")]
    Mem,
    #[serde(rename = "redis-single")]
    RedisSingle,
    #[serde(rename = "redis-cluster")]
    RedisCluster,
}

#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub provider: MailboxProvider,
    /// Address of the single redis instance (redis-single).
    pub addr: Option<String>,
    /// Seed addresses of the redis cluster (redis-cluster).
    pub addrs: Vec<String>,
}

impl MailboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let provider = match optional(ENV_MAILBOX_PROVIDER).as_deref() {
            None | Some("mem") => MailboxProvider::Mem,
            Some("redis-single") => MailboxProvider::RedisSingle,
            Some("redis-cluster") => MailboxProvider::RedisCluster,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: ENV_MAILBOX_PROVIDER,
                    reason: format!("unknown provider {other:?}"),
                });
            }
        };

        let addr = optional(ENV_MAILBOX_ADDR);
        let addrs: Vec<String> = optional(ENV_MAILBOX_ADDRS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        match provider {
            MailboxProvider::RedisSingle if addr.is_none() => Err(ConfigError::Missing(
                ENV_MAILBOX_ADDR,
            )),
            MailboxProvider::RedisCluster if addrs.is_empty() => Err(ConfigError::Missing(
                ENV_MAILBOX_ADDRS,
            )),
            _ => Ok(MailboxConfig {
                provider,
                addr,
                addrs,
            }),
        }
    }
}

/// Which authentication plugin guards the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthProvider {
    /// Header-based development plugin.
    #[serde(rename = "insecure")]
    Insecure,
    /// Sealed-payload plugin: request data must carry the session AAD.
    #[serde(rename = "sealed")]
    Sealed,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub provider: AuthProvider,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let provider = match optional(ENV_AUTH_PROVIDER).as_deref() {
            None | Some("insecure") => AuthProvider::Insecure,
            Some("sealed") => AuthProvider::Sealed,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: ENV_AUTH_PROVIDER,
                    reason: format!("unknown provider {other:?}"),
                });
            }
        };
        Ok(AuthConfig { provider })
    }
}

/// Settings for one named out-of-band callback.
#[derive(Debug, Clone)]
pub struct CallbackSpec {
    pub enabled: bool,
    pub method: String,
    pub url: String,
    pub body: Option<String>,
    pub headers: HashMap<String, String>,
    pub period_limit: Duration,
}

#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub wallet_out_of_funds: CallbackSpec,
}

impl CallbackConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let enabled = optional(ENV_CALLBACK_WALLET_OUT_OF_FUNDS_ENABLED)
            .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let url = optional(ENV_CALLBACK_WALLET_OUT_OF_FUNDS_URL).unwrap_or_default();
        if enabled && url.is_empty() {
            return Err(ConfigError::Missing(ENV_CALLBACK_WALLET_OUT_OF_FUNDS_URL));
        }

        // Headers come as a comma-separated list of name:value pairs.
        let headers = optional(ENV_CALLBACK_WALLET_OUT_OF_FUNDS_HEADERS)
            .map(|raw| {
                raw.split(',')
                    .filter_map(|pair| {
                        let (name, value) = pair.split_once(':')?;
                        Some((name.trim().to_string(), value.trim().to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let period_ms = parse_or(ENV_CALLBACK_WALLET_OUT_OF_FUNDS_PERIOD_MS, 60_000u64)?;

        Ok(CallbackConfig {
            wallet_out_of_funds: CallbackSpec {
                enabled,
                method: optional(ENV_CALLBACK_WALLET_OUT_OF_FUNDS_METHOD)
                    .unwrap_or_else(|| "POST".to_string()),
                url,
                body: optional(ENV_CALLBACK_WALLET_OUT_OF_FUNDS_BODY),
                headers,
                period_limit: Duration::from_millis(period_ms),
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_public: BindConfig,
    pub bind_private: BindConfig,
    pub backend: BackendConfig,
    pub mailbox: MailboxConfig,
    pub auth: AuthConfig,
    pub callback: CallbackConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            bind_public: BindConfig::from_env(ENV_PUBLIC_IFACE, ENV_PUBLIC_PORT, 1234)?,
            bind_private: BindConfig::from_env(ENV_PRIVATE_IFACE, ENV_PRIVATE_PORT, 1235)?,
            backend: BackendConfig::from_env()?,
            mailbox: MailboxConfig::from_env()?,
            auth: AuthConfig::from_env()?,
            callback: CallbackConfig::from_env()?,
        })
    }
}
