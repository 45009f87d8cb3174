//! Device driver capability and the registry of configured devices.
//!
//! Concrete radio/antenna/tracker/modem control logic is out of scope here;
//! the rest of the system only needs the uniform [`Driver`] operations.

use crate::config::{ConfigError, DeviceSpec};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::command::{Command, CommandResponse};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device rejected command '{command}': {reason}")]
    CommandFailed { command: String, reason: String },
    #[error("device not initialized")]
    NotInitialized,
    #[error("hardware fault: {0}")]
    HardwareFault(String),
}

/// The uniform operation set every concrete device implementation provides.
#[async_trait]
pub trait Driver: Send + Sync {
    fn device_id(&self) -> &str;

    /// Called once at startup, before any session can reach the device.
    async fn initialize(&self) -> Result<(), DriverError>;

    /// Execute one command round trip against the device.
    async fn execute_command(&self, command: &Command) -> Result<CommandResponse, DriverError>;

    /// Snapshot of driver state for status reporting.
    fn state(&self) -> serde_json::Value;
}

/// Registry of configured device drivers, fixed after startup.
pub struct DeviceRegistry {
    devices: HashMap<String, Arc<dyn Driver>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: HashMap::new(),
        }
    }

    /// Build the registry from configuration, selecting the driver
    /// implementation by its `driver` type key.
    pub fn from_config(specs: &[DeviceSpec]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();

        for spec in specs {
            let driver: Arc<dyn Driver> = match spec.driver.as_str() {
                "loopback" => Arc::new(LoopbackDriver::new(spec.device_id.clone())),
                other => {
                    return Err(ConfigError::UnknownDriverType {
                        device_id: spec.device_id.clone(),
                        driver: other.to_string(),
                    })
                }
            };
            registry.register(driver)?;
        }

        Ok(registry)
    }

    pub fn register(&mut self, driver: Arc<dyn Driver>) -> Result<(), ConfigError> {
        let device_id = driver.device_id().to_string();
        if self.devices.contains_key(&device_id) {
            return Err(ConfigError::DuplicateDevice(device_id));
        }
        self.devices.insert(device_id, driver);
        Ok(())
    }

    pub fn resolve(&self, device_id: &str) -> Option<Arc<dyn Driver>> {
        self.devices.get(device_id).cloned()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Initialize every registered driver. Called once during startup.
    pub async fn initialize_all(&self) -> Result<(), DriverError> {
        for (device_id, driver) in &self.devices {
            tracing::debug!("Initializing device '{}'", device_id);
            driver.initialize().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Virtual device that acknowledges every command and records its history.
/// Used for development pipelines and throughout the test suites.
pub struct LoopbackDriver {
    device_id: String,
    history: Mutex<Vec<String>>,
}

impl LoopbackDriver {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn command_history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for LoopbackDriver {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn initialize(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn execute_command(&self, command: &Command) -> Result<CommandResponse, DriverError> {
        self.history.lock().unwrap().push(command.command.clone());
        Ok(CommandResponse {
            command: command.command.clone(),
            result: json!({
                "device_id": self.device_id,
                "acknowledged": true,
                "parameters": command.parameters,
            }),
        })
    }

    fn state(&self) -> serde_json::Value {
        json!({
            "device_id": self.device_id,
            "commands_executed": self.history.lock().unwrap().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSpec;

    fn loopback_spec(device_id: &str) -> DeviceSpec {
        DeviceSpec {
            device_id: device_id.to_string(),
            driver: "loopback".to_string(),
            settings: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_registry_resolves_configured_devices() {
        let registry =
            DeviceRegistry::from_config(&[loopback_spec("radio_a"), loopback_spec("tnc_a")])
                .unwrap();

        registry.initialize_all().await.unwrap();
        assert!(registry.resolve("radio_a").is_some());
        assert!(registry.resolve("tnc_a").is_some());
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let err = DeviceRegistry::from_config(&[loopback_spec("radio_a"), loopback_spec("radio_a")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDevice(id) if id == "radio_a"));
    }

    #[test]
    fn test_unknown_driver_type_rejected() {
        let spec = DeviceSpec {
            device_id: "radio_a".to_string(),
            driver: "warp_core".to_string(),
            settings: Default::default(),
        };
        let err = DeviceRegistry::from_config(&[spec]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDriverType { .. }));
    }

    #[tokio::test]
    async fn test_loopback_records_history() {
        let driver = LoopbackDriver::new("radio_a");
        driver
            .execute_command(&Command::new("set_frequency"))
            .await
            .unwrap();
        driver.execute_command(&Command::new("set_mode")).await.unwrap();

        assert_eq!(driver.command_history(), vec!["set_frequency", "set_mode"]);
        assert_eq!(driver.state()["commands_executed"], 2);
    }
}
