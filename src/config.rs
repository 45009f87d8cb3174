//! Station configuration loaded once at startup.
//!
//! The parsed [`StationConfig`] value is passed explicitly into the managers
//! that need it; there is no ambient configuration lookup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Startup-fatal topology and configuration problems. The process must not
/// begin scheduling against an invalid pipeline layout.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no pipelines defined in the configuration")]
    NoPipelines,
    #[error("pipeline '{0}' declared more than once")]
    DuplicatePipeline(String),
    #[error("device '{0}' declared more than once")]
    DuplicateDevice(String),
    #[error("device '{device_id}' uses unknown driver type '{driver}'")]
    UnknownDriverType { device_id: String, driver: String },
    #[error("pipeline '{pipeline}' declares device '{device}' twice")]
    DuplicatePipelineDevice { pipeline: String, device: String },
    #[error("pipeline '{pipeline}' references unknown device '{device}'")]
    UnknownDevice { pipeline: String, device: String },
    #[error("pipeline '{0}' declares multiple input devices")]
    MultipleInputs(String),
    #[error("pipeline '{0}' declares multiple output devices")]
    MultipleOutputs(String),
    #[error("pipeline '{pipeline}' setup command targets '{destination}', which is neither 'system' nor a device bound to the pipeline")]
    InvalidSetupDestination {
        pipeline: String,
        destination: String,
    },
}

/// Top-level configuration for the hardware manager process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// When true the schedule is read from a local file instead of the
    /// user-interface API.
    #[serde(default)]
    pub offline_mode: bool,

    #[serde(default = "default_schedule_update_period")]
    pub schedule_update_period_secs: u64,

    #[serde(default = "default_schedule_update_timeout")]
    pub schedule_update_timeout_secs: u64,

    #[serde(default = "default_coordination_period")]
    pub coordination_period_secs: u64,

    #[serde(default = "default_schedule_location_local")]
    pub schedule_location_local: String,

    #[serde(default = "default_schedule_location_network")]
    pub schedule_location_network: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default)]
    pub devices: Vec<DeviceSpec>,

    #[serde(default)]
    pub pipelines: Vec<PipelineSpec>,
}

/// A single hardware device entry from the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub device_id: String,
    /// Driver type key, resolved against the driver registry at startup.
    pub driver: String,
    #[serde(default)]
    pub settings: BTreeMap<String, toml::Value>,
}

/// Declarative description of one hardware pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub id: String,
    pub mode: crate::hardware::pipeline::PipelineMode,
    #[serde(default)]
    pub description: Option<String>,
    pub hardware: Vec<DeviceBindingSpec>,
    #[serde(default)]
    pub setup_commands: Vec<SetupCommandSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceBindingSpec {
    pub device_id: String,
    #[serde(default)]
    pub pipeline_input: bool,
    #[serde(default)]
    pub pipeline_output: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupCommandSpec {
    pub command: String,
    /// Either `"system"` or `"<pipeline_id>.<device_id>"`.
    pub destination: String,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

fn default_schedule_update_period() -> u64 {
    60
}

fn default_schedule_update_timeout() -> u64 {
    15
}

fn default_coordination_period() -> u64 {
    5
}

fn default_schedule_location_local() -> String {
    "data/offline_schedule.json".to_string()
}

fn default_schedule_location_network() -> String {
    "https://localhost/api/schedule.json".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            offline_mode: false,
            schedule_update_period_secs: default_schedule_update_period(),
            schedule_update_timeout_secs: default_schedule_update_timeout(),
            coordination_period_secs: default_coordination_period(),
            schedule_location_local: default_schedule_location_local(),
            schedule_location_network: default_schedule_location_network(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            devices: Vec::new(),
            pipelines: Vec::new(),
        }
    }
}

impl StationConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StationConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn schedule_update_period(&self) -> Duration {
        Duration::from_secs(self.schedule_update_period_secs)
    }

    pub fn schedule_update_timeout(&self) -> Duration {
        Duration::from_secs(self.schedule_update_timeout_secs)
    }

    pub fn coordination_period(&self) -> Duration {
        Duration::from_secs(self.coordination_period_secs)
    }

    /// The schedule endpoint selected by `offline_mode`.
    pub fn schedule_location(&self) -> &str {
        if self.offline_mode {
            &self.schedule_location_local
        } else {
            &self.schedule_location_network
        }
    }
}
