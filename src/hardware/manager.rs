//! Registry of configured pipelines and the reservation lock table.
//!
//! The pipeline topology is fixed after startup validation; the only mutable
//! runtime state is each pipeline's lock, and that is only ever changed
//! through [`PipelineManager::reserve`] and [`PipelineManager::release`].

use crate::config::{ConfigError, PipelineSpec};
use crate::hardware::device::DeviceRegistry;
use crate::hardware::pipeline::Pipeline;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline '{0}' not found")]
    NotFound(String),
    #[error("pipeline '{pipeline}' is in use by session '{owner}'")]
    InUse { pipeline: String, owner: String },
}

/// Reservation lock for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "session_id")]
pub enum LockState {
    Free,
    LockedBy(String),
}

pub struct PipelineManager {
    pipelines: HashMap<String, Arc<Pipeline>>,
    /// Guarded check-and-set over all lock state. A reservation attempt and a
    /// release can interleave across await points elsewhere, so both go
    /// through this one mutex rather than read-then-write on the entry.
    locks: Mutex<HashMap<String, LockState>>,
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("pipelines", &self.pipelines)
            .field("locks", &self.locks)
            .finish()
    }
}

impl PipelineManager {
    /// Validate the configured pipeline topology and build the registry.
    /// Any failure here is fatal to process startup.
    pub fn from_config(
        specs: &[PipelineSpec],
        devices: &DeviceRegistry,
    ) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::NoPipelines);
        }

        let mut pipelines = HashMap::new();
        let mut locks = HashMap::new();

        for spec in specs {
            if pipelines.contains_key(&spec.id) {
                return Err(ConfigError::DuplicatePipeline(spec.id.clone()));
            }
            let pipeline = Pipeline::from_spec(spec, devices)?;
            locks.insert(spec.id.clone(), LockState::Free);
            pipelines.insert(spec.id.clone(), Arc::new(pipeline));
        }

        tracing::info!("Initialized {} pipelines", pipelines.len());

        Ok(Self {
            pipelines,
            locks: Mutex::new(locks),
        })
    }

    pub fn lookup(&self, pipeline_id: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(pipeline_id).cloned()
    }

    pub fn pipeline_ids(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    /// Atomically transition the pipeline's lock from `Free` to
    /// `LockedBy(session_id)`. A lock already held by anyone, including the
    /// same session, fails with [`PipelineError::InUse`] and mutates nothing.
    pub fn reserve(&self, pipeline_id: &str, session_id: &str) -> Result<(), PipelineError> {
        let mut locks = self.locks.lock().unwrap();
        let lock = locks
            .get_mut(pipeline_id)
            .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))?;

        match lock {
            LockState::Free => {
                *lock = LockState::LockedBy(session_id.to_string());
                tracing::debug!(
                    "Pipeline '{}' reserved by session '{}'",
                    pipeline_id,
                    session_id
                );
                Ok(())
            }
            LockState::LockedBy(owner) => Err(PipelineError::InUse {
                pipeline: pipeline_id.to_string(),
                owner: owner.clone(),
            }),
        }
    }

    /// Free the pipeline's lock. Idempotent: releasing a free or unknown
    /// pipeline is a no-op, which tolerates double-release during error
    /// unwinding.
    pub fn release(&self, pipeline_id: &str) {
        let mut locks = self.locks.lock().unwrap();
        if let Some(lock) = locks.get_mut(pipeline_id) {
            if *lock != LockState::Free {
                tracing::debug!("Pipeline '{}' released", pipeline_id);
                *lock = LockState::Free;
            }
        }
    }

    pub fn lock_state(&self, pipeline_id: &str) -> Option<LockState> {
        self.locks.lock().unwrap().get(pipeline_id).cloned()
    }
}
