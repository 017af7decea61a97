use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "could not read configuration: {e}"),
            ConfigError::Parse(e) => write!(f, "could not parse configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_gateway_url() -> String {
    "wss://gateway.discord.gg/?v=8&encoding=json".to_string()
}

fn default_api_base_url() -> String {
    "https://discordapp.com/api/v8".to_string()
}

fn default_update_interval_secs() -> u64 {
    20
}

fn default_status_timeout_secs() -> u64 {
    3
}

fn default_intents() -> u64 {
    // guilds + guild messages
    513
}

/// Runtime configuration, loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bot_token: String,
    pub state_path: PathBuf,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
    #[serde(default = "default_status_timeout_secs")]
    pub status_timeout_secs: u64,
    #[serde(default = "default_intents")]
    pub intents: u64,
}

impl Config {
    /// Load configuration from `path`. A relative `state_path` is resolved
    /// against the config file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let mut config: Config = serde_json::from_str(&raw).map_err(ConfigError::Parse)?;
        if config.state_path.is_relative() {
            if let Some(dir) = path.parent() {
                config.state_path = dir.join(&config.state_path);
            }
        }
        Ok(config)
    }
}
