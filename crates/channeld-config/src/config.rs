//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use channeld_net::compression::CompressionConfig;
use channeld_net::protocol::{ChannelType, CompressionType, ConnectionType};
use channeld_net::{ConnectionConfig, MAX_PACKET_SIZE};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level launch configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Settings for the server-role connection.
    pub server: ServerConfig,
    /// Settings for the client-role connection.
    pub client: ClientConfig,
    /// Transport settings shared by both roles.
    pub connection: ConnectionSettings,
    /// Logging settings.
    pub log: LogConfig,
}

/// Server-role connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Hub address the server connects to.
    pub hub_address: String,
    /// Hub port for server connections.
    pub hub_port: u16,
    /// Type of the channel the server creates or joins.
    pub channel_type: ChannelType,
    /// Metadata attached to the created channel.
    pub channel_metadata: String,
    /// Fan-out interval requested for the server's subscriptions.
    pub fan_out_interval_ms: u32,
}

/// Client-role connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Hub address the client connects to.
    pub hub_address: String,
    /// Hub port for client connections.
    pub hub_port: u16,
    /// Type of the channel the client sends to by default.
    pub channel_type: ChannelType,
    /// Fan-out interval requested for the client's subscriptions.
    pub fan_out_interval_ms: u32,
}

/// Transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSettings {
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Compress outbound packets before the hub negotiates a mode.
    pub compression: bool,
    /// Payloads smaller than this are sent uncompressed.
    pub compression_threshold: usize,
    /// Fail RPCs without a reply after this many milliseconds. `None` waits forever.
    pub rpc_timeout_ms: Option<u64>,
    /// Largest packet payload sent or accepted.
    pub max_packet_size: usize,
    /// Log user-space traffic at debug level.
    pub show_user_space_log: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g. "info", "debug,channeld_net=trace").
    pub level: String,
    /// Also write JSON logs to a file in debug builds.
    pub json_file: bool,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hub_address: "127.0.0.1".to_string(),
            hub_port: 11288,
            channel_type: ChannelType::Global,
            channel_metadata: "channeld-server".to_string(),
            fan_out_interval_ms: 10,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_address: "127.0.0.1".to_string(),
            hub_port: 12108,
            channel_type: ChannelType::Global,
            fan_out_interval_ms: 50,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            compression: false,
            compression_threshold: CompressionConfig::default().threshold,
            rpc_timeout_ms: None,
            max_packet_size: MAX_PACKET_SIZE,
            show_user_space_log: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: true,
        }
    }
}

/// Platform config directory for channeld tools, if any.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("channeld"))
}

// --- Role views ---

impl Config {
    /// Hub address and port for `role`.
    pub fn hub_endpoint(&self, role: ConnectionType) -> (&str, u16) {
        match role {
            ConnectionType::Server => (&self.server.hub_address, self.server.hub_port),
            _ => (&self.client.hub_address, self.client.hub_port),
        }
    }

    /// Channel type `role` creates or targets.
    pub fn channel_type(&self, role: ConnectionType) -> ChannelType {
        match role {
            ConnectionType::Server => self.server.channel_type,
            _ => self.client.channel_type,
        }
    }

    /// Fan-out interval `role` asks for when subscribing.
    pub fn fan_out_interval_ms(&self, role: ConnectionType) -> u32 {
        match role {
            ConnectionType::Server => self.server.fan_out_interval_ms,
            _ => self.client.fan_out_interval_ms,
        }
    }

    /// Session configuration for a connection of `role`.
    pub fn connection_config(&self, role: ConnectionType) -> ConnectionConfig {
        let settings = &self.connection;
        ConnectionConfig {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            compression: if settings.compression {
                CompressionType::Lz4
            } else {
                CompressionType::NoCompression
            },
            compression_threshold: settings.compression_threshold,
            rpc_timeout: settings.rpc_timeout_ms.map(Duration::from_millis),
            max_packet_size: settings.max_packet_size.min(MAX_PACKET_SIZE),
            show_user_space_log: settings.show_user_space_log,
            default_channel_type: Some(self.channel_type(role)),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Load from `config_dir`, or from the platform config directory when `None`.
    pub fn load_or_create_default(config_dir: Option<&Path>) -> Result<Self, ConfigError> {
        match config_dir {
            Some(dir) => Self::load_or_create(dir),
            None => {
                let dir = default_config_dir().ok_or(ConfigError::NoConfigDir)?;
                Self::load_or_create(&dir)
            }
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Re-read the file. Returns `Some(new_config)` if it changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let ron_str = ron::ser::to_string_pretty(
            &Config::default(),
            ron::ser::PrettyConfig::new().depth_limit(3),
        )
        .unwrap();
        assert!(ron_str.contains("hub_port: 11288"));
        assert!(ron_str.contains("hub_port: 12108"));
        assert!(ron_str.contains("channel_type: Global"));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let config: Config = ron::from_str("(server: (hub_port: 9000))").unwrap();
        assert_eq!(config.server.hub_port, 9000);
        assert_eq!(config.server.fan_out_interval_ms, 10);
        assert_eq!(config.client, ClientConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_channel_type_by_name() {
        let config: Config = ron::from_str("(server: (channel_type: Spatial))").unwrap();
        assert_eq!(config.server.channel_type, ChannelType::Spatial);
    }

    #[test]
    fn test_connection_config_per_role() {
        let mut config = Config::default();
        config.server.channel_type = ChannelType::Spatial;
        config.connection.compression = true;
        config.connection.rpc_timeout_ms = Some(1500);
        config.connection.max_packet_size = usize::MAX;

        let server = config.connection_config(ConnectionType::Server);
        assert_eq!(server.default_channel_type, Some(ChannelType::Spatial));
        assert_eq!(server.compression, CompressionType::Lz4);
        assert_eq!(server.rpc_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(server.max_packet_size, MAX_PACKET_SIZE);
        assert_eq!(server.connect_timeout, Duration::from_millis(3000));

        let client = config.connection_config(ConnectionType::Client);
        assert_eq!(client.default_channel_type, Some(ChannelType::Global));
        assert_eq!(config.hub_endpoint(ConnectionType::Client), ("127.0.0.1", 12108));
        assert_eq!(config.fan_out_interval_ms(ConnectionType::Client), 50);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.hub_address = "10.0.0.1".to_string();
        config.client.fan_out_interval_ms = 20;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create_default(Some(dir.path())).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.log.level = "debug".to_string();
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.log.level, "debug");
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
