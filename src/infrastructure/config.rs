use crate::application::connection_manager::StreamSettings;
use crate::application::reconciler::ReconcileSettings;
use crate::domain::machine::MachineId;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ConsoleConfig {
    pub backend: BackendSettings,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendSettings {
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Update stream path; `${machine_id}` is replaced per machine.
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    #[serde(default = "default_context_path")]
    pub context_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconciliationConfig {
    #[serde(default = "default_freshness_window_secs")]
    pub freshness_window_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeviceConfig {
    /// Machines subscribed at startup.
    #[serde(default)]
    pub machine_ids: Vec<MachineId>,
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_stream_path() -> String {
    "/api/sse/updates/${machine_id}".to_string()
}

fn default_context_path() -> String {
    "/api/maquina/${machine_id}/contexto".to_string()
}

fn default_reconnect_interval_secs() -> u64 {
    5
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}

fn default_freshness_window_secs() -> u64 {
    120
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_state_path() -> PathBuf {
    PathBuf::from("data/session.json")
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_secs: default_reconnect_interval_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: default_freshness_window_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
        }
    }
}

impl StreamConfig {
    pub fn settings(&self) -> StreamSettings {
        StreamSettings {
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            max_consecutive_failures: self.max_consecutive_failures.max(1),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
        }
    }
}

impl ReconciliationConfig {
    pub fn settings(&self) -> ReconcileSettings {
        ReconcileSettings::from_secs(self.freshness_window_secs)
    }
}

/// Load `config/console.*`, then `CONSOLE__SECTION__KEY` environment overrides.
pub fn load_console_config() -> anyhow::Result<ConsoleConfig> {
    load_console_config_from("config/console")
}

pub fn load_console_config_from(name: &str) -> anyhow::Result<ConsoleConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(name).required(false))
        .add_source(
            config::Environment::with_prefix("CONSOLE")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("device.machine_ids")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

/// Fill the `${machine_id}` placeholder of a backend path
pub fn machine_path(template: &str, machine_id: MachineId) -> String {
    template.replace("${machine_id}", &machine_id.to_string())
}
