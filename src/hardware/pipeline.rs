//! A hardware pipeline: a named, statically configured chain of devices with
//! at most one designated input and one output.

use crate::command::Command;
use crate::config::{ConfigError, PipelineSpec};
use crate::hardware::device::{DeviceRegistry, Driver};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    Transmit,
    Receive,
    Transceive,
}

/// One device's membership in a pipeline.
#[derive(Debug, Clone)]
pub struct DeviceBinding {
    pub device_id: String,
    pub is_input: bool,
    pub is_output: bool,
}

/// A pre-use configuration step executed before a session becomes active.
#[derive(Debug, Clone)]
pub struct SetupCommand {
    pub command: Command,
    /// `"system"` or `"<pipeline_id>.<device_id>"`.
    pub destination: String,
}

/// Immutable description of one hardware chain. Lock state is tracked by the
/// [`PipelineManager`](crate::hardware::manager::PipelineManager), never here.
pub struct Pipeline {
    pub id: String,
    pub mode: PipelineMode,
    pub description: Option<String>,
    pub bindings: Vec<DeviceBinding>,
    pub setup_commands: Vec<SetupCommand>,
    devices: HashMap<String, Arc<dyn Driver>>,
    output_device: Option<String>,
    input_device: Option<String>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("description", &self.description)
            .field("bindings", &self.bindings)
            .field("setup_commands", &self.setup_commands)
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("output_device", &self.output_device)
            .field("input_device", &self.input_device)
            .finish()
    }
}

impl Pipeline {
    /// Build and validate one pipeline from its configuration entry,
    /// resolving every declared device against the registry.
    ///
    /// Checks, all fatal: duplicate devices, unresolvable devices, more than
    /// one input or output binding, and setup commands whose destination is
    /// neither `"system"` nor a device bound to this pipeline.
    pub fn from_spec(spec: &PipelineSpec, registry: &DeviceRegistry) -> Result<Self, ConfigError> {
        let mut devices: HashMap<String, Arc<dyn Driver>> = HashMap::new();
        let mut bindings = Vec::with_capacity(spec.hardware.len());
        let mut input_device = None;
        let mut output_device = None;

        for entry in &spec.hardware {
            if devices.contains_key(&entry.device_id) {
                return Err(ConfigError::DuplicatePipelineDevice {
                    pipeline: spec.id.clone(),
                    device: entry.device_id.clone(),
                });
            }

            let driver =
                registry
                    .resolve(&entry.device_id)
                    .ok_or_else(|| ConfigError::UnknownDevice {
                        pipeline: spec.id.clone(),
                        device: entry.device_id.clone(),
                    })?;
            devices.insert(entry.device_id.clone(), driver);

            if entry.pipeline_input {
                if input_device.is_some() {
                    return Err(ConfigError::MultipleInputs(spec.id.clone()));
                }
                input_device = Some(entry.device_id.clone());
            }
            if entry.pipeline_output {
                if output_device.is_some() {
                    return Err(ConfigError::MultipleOutputs(spec.id.clone()));
                }
                output_device = Some(entry.device_id.clone());
            }

            bindings.push(DeviceBinding {
                device_id: entry.device_id.clone(),
                is_input: entry.pipeline_input,
                is_output: entry.pipeline_output,
            });
        }

        let mut setup_commands = Vec::with_capacity(spec.setup_commands.len());
        for entry in &spec.setup_commands {
            if entry.destination != "system" {
                match entry.destination.split_once('.') {
                    Some((pipeline_id, device_id))
                        if pipeline_id == spec.id && devices.contains_key(device_id) => {}
                    _ => {
                        return Err(ConfigError::InvalidSetupDestination {
                            pipeline: spec.id.clone(),
                            destination: entry.destination.clone(),
                        })
                    }
                }
            }
            setup_commands.push(SetupCommand {
                command: Command {
                    command: entry.command.clone(),
                    parameters: entry.parameters.clone(),
                },
                destination: entry.destination.clone(),
            });
        }

        Ok(Self {
            id: spec.id.clone(),
            mode: spec.mode,
            description: spec.description.clone(),
            bindings,
            setup_commands,
            devices,
            output_device,
            input_device,
        })
    }

    /// The driver bound to `device_id`, if the device belongs to this pipeline.
    pub fn device(&self, device_id: &str) -> Option<Arc<dyn Driver>> {
        self.devices.get(device_id).cloned()
    }

    pub fn has_device(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// The designated output device, if the pipeline declares one.
    pub fn output_device(&self) -> Option<&str> {
        self.output_device.as_deref()
    }

    pub fn input_device(&self) -> Option<&str> {
        self.input_device.as_deref()
    }
}
