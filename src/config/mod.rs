//! Configuration module
//!
//! Handles loading and saving Boardlink configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::NetworkConfig as NetConfig;
use crate::protocol::{validate_identifier, DEFAULT_PORT, MAX_FRAME_SIZE};
use crate::shared_var::{SharedVarResult, SharedVariableInfo, WriterPolicy};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid module name: {0:?}")]
    InvalidModuleName(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Variables declared when the service starts
    #[serde(default)]
    pub shared_variables: Vec<SharedVariableConfig>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name this module uses as command source
    #[serde(default = "default_module_name")]
    pub module_name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

fn default_module_name() -> String {
    hostname::get()
        .map(|h| sanitize_module_name(&h.to_string_lossy()))
        .unwrap_or_else(|_| "boardlink".to_string())
}

/// Map a host name onto the identifier alphabet
fn sanitize_module_name(raw: &str) -> String {
    let name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "boardlink".to_string()
    } else {
        name
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            module_name: default_module_name(),
            verbose: false,
            log_file: None,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Peers that take longer than this to accept a frame are dropped (ms)
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Events buffered per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_write_timeout() -> u64 {
    5000
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            connect_timeout_ms: default_connect_timeout(),
            write_timeout_ms: default_write_timeout(),
            max_frame_size: default_max_frame_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl NetworkConfig {
    /// Runtime network settings, optionally overriding the port
    pub fn to_network_config(&self, port: Option<u16>) -> NetConfig {
        let mut config = NetConfig::new(port.unwrap_or(self.port))
            .with_max_frame_size(self.max_frame_size);
        if let Some(bind_address) = &self.bind_address {
            config = config.with_bind_address(bind_address.as_str());
        }
        config.connect_timeout_ms = self.connect_timeout_ms;
        config.write_timeout_ms = self.write_timeout_ms;
        config.event_capacity = self.event_capacity;
        config
    }
}

/// A shared variable declared in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedVariableConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub is_array: bool,
    /// Element count of a bounded array
    pub length: Option<usize>,
    /// Modules allowed to write; absent means every module
    pub writers: Option<Vec<String>>,
}

impl SharedVariableConfig {
    pub fn to_info(&self) -> SharedVarResult<SharedVariableInfo> {
        let info = if self.is_array {
            SharedVariableInfo::array(self.name.as_str(), self.type_name.as_str(), self.length)
        } else {
            SharedVariableInfo::scalar(self.name.as_str(), self.type_name.as_str())
        };
        Ok(info.with_writers(WriterPolicy::from_optional_list(self.writers.clone())?))
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        if validate_identifier(&config.general.module_name).is_err() {
            return Err(ConfigError::InvalidModuleName(config.general.module_name));
        }
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("boardlink/config.toml")),
            Some(PathBuf::from("./boardlink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            module_name: "blackboard".to_string(),
            verbose: false,
            log_file: None,
        },
        shared_variables: vec![
            SharedVariableConfig {
                name: "robot_pose".to_string(),
                type_name: "string".to_string(),
                is_array: false,
                length: None,
                writers: Some(vec!["localizer".to_string()]),
            },
            SharedVariableConfig {
                name: "laser_scan".to_string(),
                type_name: "double".to_string(),
                is_array: true,
                length: Some(360),
                writers: None,
            },
        ],
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
