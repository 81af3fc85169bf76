//! Configuration structs and the environment-backed source that fills them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Floor applied to the WebSocket auth timeout.
pub const MIN_AUTH_TIMEOUT: Duration = Duration::from_millis(10);

/// Broadcast server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Path that accepts WebSocket upgrades
    pub ws_path: String,
    /// Prefix bridged to the backend as `api_request`
    pub api_prefix: String,
    /// Hold upgrades until the backend authorizes them
    pub auth_enabled: bool,
    pub auth_timeout: Duration,
    pub api_timeout: Duration,
    /// Clients written to concurrently per broadcast
    pub broadcast_concurrency: usize,
    /// Outbound frames buffered per client
    pub client_queue_capacity: usize,
    /// How long a full client queue may block a send before the client is dropped
    pub slow_client_timeout: Duration,
    /// Capacity of the server event channel
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            ws_path: "/".to_string(),
            api_prefix: "/api".to_string(),
            auth_enabled: false,
            auth_timeout: Duration::from_secs(5),
            api_timeout: Duration::from_secs(30),
            broadcast_concurrency: 20,
            client_queue_capacity: 256,
            slow_client_timeout: Duration::from_secs(5),
            event_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Auth timeout after applying [`MIN_AUTH_TIMEOUT`].
    pub fn effective_auth_timeout(&self) -> Duration {
        self.auth_timeout.max(MIN_AUTH_TIMEOUT)
    }
}

/// Backend supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Executable to spawn
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Extra environment for the child
    pub env: Vec<(String, String)>,
    /// Directory watched for source changes (development only)
    pub source_root: Option<PathBuf>,
    /// Passed to the child as `MODELCAST_RUNTIME_ROOT`
    pub runtime_root: Option<PathBuf>,
    pub respawn_delay: Duration,
    /// Deadline for the child to connect and send `ready`
    pub ready_timeout: Duration,
    pub watch_debounce: Duration,
    /// Disables the source watcher
    pub production: bool,
    /// Forward child log records over the channel
    pub log_passthrough: bool,
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::new(),
            args: Vec::new(),
            env: Vec::new(),
            source_root: None,
            runtime_root: None,
            respawn_delay: Duration::from_secs(3),
            ready_timeout: Duration::from_secs(30),
            watch_debounce: Duration::from_millis(300),
            production: false,
            log_passthrough: true,
            event_capacity: 256,
        }
    }
}

/// Reconnect delay policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.3,
        }
    }
}

/// Client runtime configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port/path`
    pub url: String,
    pub rpc_timeout: Duration,
    pub backoff: BackoffConfig,
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090/".to_string(),
            rpc_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            event_capacity: 256,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration key {0}")]
    Missing(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// A key/value configuration provider.
pub trait ConfigSource {
    fn get_key(&self, key: &str) -> Option<String>;

    fn is_production(&self) -> bool;

    /// Like [`get_key`](Self::get_key) but fails on a missing or empty value.
    fn get_checked_key(&self, key: &str) -> Result<String, ConfigError> {
        self.get_key(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    /// Parse a key, falling back to `default` when unset.
    fn parse_key<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        Self: Sized,
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_key(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn millis_key(&self, key: &str, default: Duration) -> Result<Duration, ConfigError>
    where
        Self: Sized,
    {
        self.parse_key(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    fn flag_key(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get_key(key).as_deref().map(str::trim) {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off" | "") => Ok(false),
            Some(other) => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: other.to_string(),
                reason: "expected a boolean".to_string(),
            }),
        }
    }
}

/// Reads `MODELCAST_*` environment variables, with optional overrides.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    overrides: HashMap<String, String>,
}

impl EnvConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value that shadows the process environment.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        let defaults = ServerConfig::default();
        Ok(ServerConfig {
            bind_addr: self.get_key("MODELCAST_BIND").unwrap_or(defaults.bind_addr),
            ws_path: self.get_key("MODELCAST_WS_PATH").unwrap_or(defaults.ws_path),
            api_prefix: self
                .get_key("MODELCAST_API_PREFIX")
                .unwrap_or(defaults.api_prefix),
            auth_enabled: self.flag_key("MODELCAST_AUTH", defaults.auth_enabled)?,
            auth_timeout: self.millis_key("MODELCAST_AUTH_TIMEOUT_MS", defaults.auth_timeout)?,
            api_timeout: self.millis_key("MODELCAST_API_TIMEOUT_MS", defaults.api_timeout)?,
            broadcast_concurrency: self
                .parse_key("MODELCAST_BROADCAST_CONCURRENCY", defaults.broadcast_concurrency)?
                .max(1),
            client_queue_capacity: self
                .parse_key("MODELCAST_CLIENT_QUEUE", defaults.client_queue_capacity)?
                .max(1),
            slow_client_timeout: self.millis_key(
                "MODELCAST_SLOW_CLIENT_TIMEOUT_MS",
                defaults.slow_client_timeout,
            )?,
            event_capacity: defaults.event_capacity,
        })
    }

    pub fn supervisor_config(&self) -> Result<SupervisorConfig, ConfigError> {
        let defaults = SupervisorConfig::default();
        let command = PathBuf::from(self.get_checked_key("MODELCAST_BACKEND_CMD")?);
        let args = self
            .get_key("MODELCAST_BACKEND_ARGS")
            .map(|raw| raw.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        Ok(SupervisorConfig {
            command,
            args,
            source_root: self.get_key("MODELCAST_SOURCE_ROOT").map(PathBuf::from),
            runtime_root: self.get_key("MODELCAST_RUNTIME_ROOT").map(PathBuf::from),
            respawn_delay: self.millis_key("MODELCAST_RESPAWN_DELAY_MS", defaults.respawn_delay)?,
            ready_timeout: self.millis_key("MODELCAST_READY_TIMEOUT_MS", defaults.ready_timeout)?,
            watch_debounce: self
                .millis_key("MODELCAST_WATCH_DEBOUNCE_MS", defaults.watch_debounce)?,
            production: self.is_production(),
            log_passthrough: self.flag_key("MODELCAST_LOG_PASSTHROUGH", defaults.log_passthrough)?,
            ..defaults
        })
    }

    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        let defaults = ClientConfig::default();
        Ok(ClientConfig {
            url: self.get_key("MODELCAST_URL").unwrap_or(defaults.url),
            rpc_timeout: self.millis_key("MODELCAST_RPC_TIMEOUT_MS", defaults.rpc_timeout)?,
            ..defaults
        })
    }
}

impl ConfigSource for EnvConfig {
    fn get_key(&self, key: &str) -> Option<String> {
        self.overrides
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    }

    fn is_production(&self) -> bool {
        self.get_key("MODELCAST_ENV")
            .is_some_and(|env| env.eq_ignore_ascii_case("production"))
    }
}
