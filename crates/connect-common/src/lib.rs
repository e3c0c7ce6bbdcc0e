use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config/connect_config.yaml";
pub const CONFIG_PATH_ENV: &str = "CONNECT_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {field} {message}")]
    Invalid {
        field: &'static str,
        message: &'static str,
    },
}

/// Which side(s) of the load test this process runs.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
    #[default]
    Both,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub metrics: MetricsConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub port: u16,
    pub listen_backlog: u32,
    /// Number of accept operations kept outstanding at once.
    pub concurrent_accepts: usize,
    pub receive_buffer_size: usize,
    /// Pool capacity; must exceed the number of connections the server will hold.
    pub receive_buffer_count: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 8080,
            listen_backlog: 500,
            concurrent_accepts: 10,
            receive_buffer_size: 256,
            receive_buffer_count: 65536,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub target_host: String,
    pub port: u16,
    /// Number of connections to ramp up to.
    pub connection_limit: usize,
    /// Messages per second, spread round-robin across all connections.
    pub message_rate: usize,
    pub message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target_host: "127.0.0.1".to_string(),
            port: 8080,
            connection_limit: 1,
            message_rate: 1,
            message_size: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReportConfig {
    pub client_interval_secs: u64,
    pub server_interval_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            client_interval_secs: 2,
            server_interval_secs: 5,
        }
    }
}

impl Config {
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the config at `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(data) => Self::from_yaml(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Resolves the config path from `CONNECT_CONFIG`, falling back to the default location.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (
                self.client.connection_limit == 0,
                "client.connection_limit",
                "must be at least 1",
            ),
            (
                self.client.message_size == 0,
                "client.message_size",
                "must be at least 1 byte",
            ),
            (
                self.server.concurrent_accepts == 0,
                "server.concurrent_accepts",
                "must be at least 1",
            ),
            (
                self.server.receive_buffer_size == 0,
                "server.receive_buffer_size",
                "must be at least 1 byte",
            ),
            (
                self.server.receive_buffer_count == 0,
                "server.receive_buffer_count",
                "must be at least 1",
            ),
            (
                self.report.client_interval_secs == 0,
                "report.client_interval_secs",
                "must be at least 1 second",
            ),
            (
                self.report.server_interval_secs == 0,
                "report.server_interval_secs",
                "must be at least 1 second",
            ),
        ];

        match checks.into_iter().find(|(failed, _, _)| *failed) {
            Some((_, field, message)) => Err(ConfigError::Invalid { field, message }),
            None => Ok(()),
        }
    }
}
