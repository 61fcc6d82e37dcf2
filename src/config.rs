use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BackendError, Result};
use crate::oplog::LoggingMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub mode: LoggingMode,
}

/// Construction parameters, selected by `type`.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Local(LocalConfig),
    Memory(MemoryConfig),
    Remote(RemoteConfig),
}

impl BackendConfig {
    /// Human-readable description of the backend
    pub fn description(&self) -> String {
        match self {
            BackendConfig::Local(local) => format!("local ({})", local.root),
            BackendConfig::Memory(memory) => format!("memory ({})", memory.root),
            BackendConfig::Remote(remote) => {
                format!("remote ({}:{} {})", remote.host, remote.port, remote.root)
            }
        }
    }

    /// Decodes a merged [`ConfigLayer`].
    pub fn from_layer(layer: ConfigLayer) -> Result<Self> {
        serde_json::from_value(Value::Object(layer))
            .map_err(|e| BackendError::invalid_config(e.to_string()))
    }

    pub fn to_layer(&self) -> Result<ConfigLayer> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(BackendError::invalid_config("backend config is not a table")),
            Err(e) => Err(BackendError::invalid_config(e.to_string())),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Namespace isolation when `bwrap` is installed, software otherwise.
    #[default]
    Auto,
    #[serde(alias = "bwrap")]
    Namespace,
    /// Direct spawn guarded by the command classifier.
    Software,
    None,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMode::Auto => "auto",
            IsolationMode::Namespace => "namespace",
            IsolationMode::Software => "software",
            IsolationMode::None => "none",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShellPreference {
    #[default]
    Auto,
    Bash,
    Sh,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LocalConfig {
    pub root: String,
    #[serde(default)]
    pub isolation: IsolationMode,
    #[serde(default)]
    pub shell: ShellPreference,
    #[serde(default = "default_true")]
    pub prevent_dangerous: bool,
    /// Extra regexes exempting commands from the dangerous set.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    pub max_output_length: Option<usize>,
    /// Fail construction when the shell is not on PATH.
    #[serde(default)]
    pub validate_utils: bool,
}

impl LocalConfig {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            isolation: IsolationMode::default(),
            shell: ShellPreference::default(),
            prevent_dangerous: true,
            allowed_commands: Vec::new(),
            max_output_length: None,
            validate_utils: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_root")]
    pub root: String,
    #[serde(default)]
    pub initial_data: BTreeMap<String, String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            root: default_memory_root(),
            initial_data: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RemoteConfig {
    pub root: String,
    pub host: String,
    /// Supports ${ENV_VAR} substitution
    pub auth_token: Option<String>,
    #[serde(default = "default_remote_port")]
    pub port: u16,
    pub operation_timeout_ms: Option<u64>,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_keepalive_count_max")]
    pub keepalive_count_max: u32,
    #[serde(default = "default_true")]
    pub prevent_dangerous: bool,
    pub max_output_length: Option<usize>,
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
    /// MCP endpoint host when it differs from `host`.
    pub mcp_host: Option<String>,
    #[serde(default = "default_mcp_port")]
    pub mcp_port: u16,
}

impl RemoteConfig {
    pub fn new(root: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            host: host.into(),
            auth_token: None,
            port: default_remote_port(),
            operation_timeout_ms: None,
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_count_max: default_keepalive_count_max(),
            prevent_dangerous: true,
            max_output_length: None,
            reconnection: ReconnectionConfig::default(),
            mcp_host: None,
            mcp_port: default_mcp_port(),
        }
    }

    /// Base URL of the daemon's MCP endpoint.
    pub fn mcp_url(&self) -> String {
        let host = self.mcp_host.as_deref().unwrap_or(&self.host);
        format!("http://{host}:{}/mcp", self.mcp_port)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReconnectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_memory_root() -> String {
    "/".to_string()
}

fn default_remote_port() -> u16 {
    3000
}

fn default_keepalive_interval_ms() -> u64 {
    30_000
}

fn default_keepalive_count_max() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_mcp_port() -> u16 {
    3001
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${AGENT_BACKEND_TOKEN}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

/// One shallow configuration layer (a JSON object).
pub type ConfigLayer = Map<String, Value>;

/// Overlay keys replace base keys wholesale; nested tables are not merged.
pub fn merge_layers(base: &ConfigLayer, overlay: &ConfigLayer) -> ConfigLayer {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
