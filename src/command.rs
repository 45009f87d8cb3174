//! Command values and the handler capability used for pipeline setup
//! commands and session command delivery.
//!
//! Inbound parsing, schema validation, and user permissions live outside this
//! crate; everything here receives already-validated commands.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An already-validated command addressed at a destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parameters: None,
        }
    }

    pub fn with_parameters(command: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            command: command.into(),
            parameters: Some(parameters),
        }
    }
}

/// JSON payload produced by a successfully executed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command: String,
    pub result: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("no handler accepts destination '{0}'")]
    UnknownDestination(String),
    #[error("driver error: {0}")]
    Driver(#[from] crate::hardware::device::DriverError),
}

/// Capability implemented by everything that can execute commands for a
/// destination. Concrete handlers are selected from a registry keyed by
/// destination, not by subclassing.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn can_handle(&self, destination: &str) -> bool;

    async fn handle(&self, command: &Command) -> Result<CommandResponse, CommandError>;
}

/// Handles station-level commands addressed to the `"system"` destination.
pub struct SystemCommandHandler;

impl SystemCommandHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemCommandHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandHandler for SystemCommandHandler {
    fn can_handle(&self, destination: &str) -> bool {
        destination == "system"
    }

    async fn handle(&self, command: &Command) -> Result<CommandResponse, CommandError> {
        match command.command.as_str() {
            "station_time" => Ok(CommandResponse {
                command: command.command.clone(),
                result: serde_json::json!({ "timestamp": Utc::now().timestamp() }),
            }),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_station_time_reports_timestamp() {
        let handler = SystemCommandHandler::new();
        assert!(handler.can_handle("system"));
        assert!(!handler.can_handle("uhf_downlink.radio_a"));

        let response = handler.handle(&Command::new("station_time")).await.unwrap();
        assert_eq!(response.command, "station_time");
        assert!(response.result.get("timestamp").unwrap().as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_unknown_system_command_rejected() {
        let handler = SystemCommandHandler::new();
        let err = handler
            .handle(&Command::new("flux_capacitor"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand(name) if name == "flux_capacitor"));
    }
}
