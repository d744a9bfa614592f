//! Configuration lookup and the validated server settings.
//!
//! Every key is read with namespacing: `{name}.{key}` first, then `{key}`,
//! then the hard-coded default.
//!
//! ```toml
//! bind = "0.0.0.0:65432"
//! transport_type = "tls"
//! tls_server_cert = "certificates/cert.pem"
//! tls_server_key = "certificates/key.pem"
//! overflow_policy = "drop_oldest"
//! users = ["alice", "bob", "carol"]
//!
//! [groups]
//! devs = ["alice", "bob"]
//! ```

use crate::error::Error;
use crate::session::OverflowPolicy;
use ::config::Config;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "127.0.0.1:65432";
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_SEND_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 1024;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

// Missing keys fall back to the default; malformed ones are reported.
fn or_default<T>(result: Result<T, config::ConfigError>, default: T) -> Result<T, Error> {
    match result {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => Ok(default),
        Err(err) => Err(err.into()),
    }
}

/// Validated runtime settings for a relay server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Address the acceptor binds to.
    pub bind: String,
    /// Either `"tls"` or `"tcp"`.
    pub transport_type: String,
    pub tls_server_cert: Option<String>,
    pub tls_server_key: Option<String>,
    /// Bounds the TLS handshake and the wait for the declared name.
    pub handshake_timeout: Duration,
    /// How long a Send Loop waits on an empty queue before re-checking the
    /// registry.
    pub send_poll_interval: Duration,
    pub max_message_size: usize,
    /// Zero means unbounded.
    pub outbound_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            transport_type: "tls".to_string(),
            tls_server_cert: None,
            tls_server_key: None,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            send_poll_interval: Duration::from_millis(DEFAULT_SEND_POLL_INTERVAL_MS),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl ServerSettings {
    /// Reads settings from the un-namespaced keys of `config`.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads settings, preferring keys under the `[name]` table.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();

        let overflow_policy = match get_namespaced_string(config, name, "overflow_policy") {
            Ok(policy) => policy.parse()?,
            Err(config::ConfigError::NotFound(_)) => defaults.overflow_policy,
            Err(err) => return Err(err.into()),
        };

        let optional_string = |key: &str| -> Result<Option<String>, Error> {
            match get_namespaced_string(config, name, key) {
                Ok(value) => Ok(Some(value)),
                Err(config::ConfigError::NotFound(_)) => Ok(None),
                Err(err) => Err(err.into()),
            }
        };

        Ok(Self {
            bind: or_default(get_namespaced_string(config, name, "bind"), defaults.bind)?,
            transport_type: or_default(
                get_namespaced_string(config, name, "transport_type"),
                defaults.transport_type,
            )?,
            tls_server_cert: optional_string("tls_server_cert")?,
            tls_server_key: optional_string("tls_server_key")?,
            handshake_timeout: Duration::from_millis(or_default(
                get_namespaced_u64(config, name, "handshake_timeout_ms"),
                DEFAULT_HANDSHAKE_TIMEOUT_MS,
            )?),
            send_poll_interval: Duration::from_millis(or_default(
                get_namespaced_u64(config, name, "send_poll_interval_ms"),
                DEFAULT_SEND_POLL_INTERVAL_MS,
            )?),
            max_message_size: or_default(
                get_namespaced_usize(config, name, "max_message_size"),
                DEFAULT_MAX_MESSAGE_SIZE,
            )?,
            outbound_queue_capacity: or_default(
                get_namespaced_usize(config, name, "outbound_queue_capacity"),
                DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            )?,
            overflow_policy,
        })
    }
}

/// Registered users listed under `users`.
pub fn seed_users(config: &Config, name: &str) -> Result<Vec<String>, Error> {
    or_default(
        get_namespaced_value(config, name, "users", |cfg, key| cfg.get::<Vec<String>>(key)),
        Vec::new(),
    )
}

/// Group memberships listed under the `groups` table.
pub fn seed_groups(config: &Config, name: &str) -> Result<HashMap<String, Vec<String>>, Error> {
    or_default(
        get_namespaced_value(config, name, "groups", |cfg, key| {
            cfg.get::<HashMap<String, Vec<String>>>(key)
        }),
        HashMap::new(),
    )
}
