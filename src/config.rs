use std::{fs, path::Path, path::PathBuf, time::Duration};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeConfig;
use crate::error::AppError;
use crate::gpio::ChannelId;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeDetect {
    /// Whether a channel configured with `self` reports an observed `edge`.
    pub fn matches(self, edge: EdgeDetect) -> bool {
        match self {
            EdgeDetect::None => false,
            EdgeDetect::Rising => edge == EdgeDetect::Rising,
            EdgeDetect::Falling => edge == EdgeDetect::Falling,
            EdgeDetect::Both => matches!(edge, EdgeDetect::Rising | EdgeDetect::Falling),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub chip: String,
    pub line: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BridgeSection {
    pub input_channel: ChannelId,
    pub output_channel: ChannelId,
    #[serde(default)]
    pub initial_output_state: bool,
    #[serde(default)]
    pub debounce_ms: i64,
    #[serde(default = "default_input_edge")]
    pub input_edge: EdgeDetect,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModuleConfig {
    pub name: String,
    pub path: PathBuf,
    pub bridge: BridgeSection,
}

impl ModuleConfig {
    pub fn bridge_config(&self) -> Result<BridgeConfig, AppError> {
        let section = &self.bridge;
        let debounce_ms = u64::try_from(section.debounce_ms).map_err(|_| {
            AppError::Configuration(format!(
                "module {}: debounce_ms must not be negative, got {}",
                self.name, section.debounce_ms
            ))
        })?;

        Ok(BridgeConfig {
            input_channel: section.input_channel,
            output_channel: section.output_channel,
            initial_output_state: section.initial_output_state,
            debounce_window: Duration::from_millis(debounce_ms),
            input_edge: section.input_edge,
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    #[serde(default)]
    pub channels: FxHashMap<ChannelId, ChannelConfig>,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Configuration(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| AppError::Configuration(format!("Invalid config json: {e}")))?;
        if config.broadcast_capacity == 0 {
            return Err(AppError::Configuration(
                "broadcast_capacity must be greater than zero".into(),
            ));
        }
        Ok(config)
    }
}

fn default_http_timeout() -> u64 {
    30
}

fn default_input_edge() -> EdgeDetect {
    EdgeDetect::Both
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_event_history_capacity() -> usize {
    32
}
