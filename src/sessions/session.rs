//! Session lifecycle state machine.
//!
//! One session tracks one reservation's progression from hardware setup
//! through active use to teardown. State moves strictly forward along
//! `Pending -> Starting -> Active -> Ending -> Ended`, with `Error` terminal
//! from any pre-teardown state; no state is ever revisited. Every failure
//! path lands in `Error` or `Ended` with the pipeline lock released.

use crate::command::{Command, CommandError, CommandHandler, CommandResponse};
use crate::hardware::manager::{PipelineError, PipelineManager};
use crate::hardware::pipeline::Pipeline;
use crate::sessions::schedule::Reservation;
use crate::telemetry::TelemetrySink;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Starting,
    Active,
    Ending,
    Ended,
    Error,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Pending => "pending",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Ending => "ending",
            SessionState::Ended => "ended",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// What took a session to the `Error` state, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SessionFault {
    Pipeline { message: String },
    SetupCommand {
        command: String,
        destination: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not reserve pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("setup command '{command}' for '{destination}' failed: {source}")]
    SetupCommandFailed {
        command: String,
        destination: String,
        source: CommandError,
    },
    #[error("session '{session}' is not active (state: {state})")]
    NotActive {
        session: String,
        state: SessionState,
    },
    #[error("device '{device}' is not part of pipeline '{pipeline}'")]
    UnknownDevice { pipeline: String, device: String },
    #[error("no session owns '{pipeline}.{device}'")]
    NoSession { pipeline: String, device: String },
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Status snapshot exposed for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    pub user_id: String,
    pub pipeline_id: String,
    pub state: SessionState,
    pub error: Option<SessionFault>,
}

struct Inner {
    state: SessionState,
    fault: Option<SessionFault>,
}

/// Runtime object for one reservation's exclusive use of one pipeline.
/// Identity equals the reservation id; one session per reservation, ever.
pub struct Session {
    pub id: String,
    pub user_id: String,
    pipeline_id: String,
    /// `None` when the reservation names a pipeline the registry does not
    /// know; `start()` then fails with the registry's `NotFound`.
    pipeline: Option<Arc<Pipeline>>,
    pipelines: Arc<PipelineManager>,
    system_commands: Arc<dyn CommandHandler>,
    telemetry: Arc<dyn TelemetrySink>,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(
        reservation: &Reservation,
        pipelines: Arc<PipelineManager>,
        system_commands: Arc<dyn CommandHandler>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let pipeline = pipelines.lookup(&reservation.pipeline_id);
        Self {
            id: reservation.id.clone(),
            user_id: reservation.user_id.clone(),
            pipeline_id: reservation.pipeline_id.clone(),
            pipeline,
            pipelines,
            system_commands,
            telemetry,
            inner: Mutex::new(Inner {
                state: SessionState::Pending,
                fault: None,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn has_device(&self, device_id: &str) -> bool {
        self.pipeline
            .as_ref()
            .map_or(false, |p| p.has_device(device_id))
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().unwrap();
        SessionStatus {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            state: inner.state,
            error: inner.fault.clone(),
        }
    }

    /// Move to `to` only if the current state is in `from`. Transitions are
    /// checked under the lock so a teardown racing a still-starting setup can
    /// never step a session backwards.
    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if from.contains(&inner.state) {
            tracing::debug!("Session '{}': {} -> {}", self.id, inner.state, to);
            inner.state = to;
            true
        } else {
            false
        }
    }

    fn fail(&self, fault: SessionFault) {
        let mut inner = self.inner.lock().unwrap();
        tracing::debug!("Session '{}': {} -> error", self.id, inner.state);
        inner.state = SessionState::Error;
        inner.fault = Some(fault);
    }

    /// Reserve the pipeline, run its setup commands in declared order, and
    /// register the output stream with the telemetry sink.
    ///
    /// A reservation failure or the first setup-command failure aborts the
    /// remainder, releases the pipeline, and leaves the session in `Error`.
    pub async fn start(&self) -> Result<(), SessionError> {
        if self.state() != SessionState::Pending {
            tracing::warn!("Session '{}' start() called more than once", self.id);
            return Ok(());
        }

        // Reservation failure goes straight to Error: no setup was attempted
        // and there is nothing to release. An unknown pipeline id surfaces
        // here as the registry's NotFound.
        if let Err(e) = self.pipelines.reserve(&self.pipeline_id, &self.id) {
            tracing::error!("Session '{}' could not reserve its pipeline: {}", self.id, e);
            self.fail(SessionFault::Pipeline {
                message: e.to_string(),
            });
            return Err(e.into());
        }

        let Some(pipeline) = self.pipeline.clone() else {
            // The registry granted a lock for an id we could not resolve at
            // construction; the two views of the registry are out of step.
            self.pipelines.release(&self.pipeline_id);
            let e = PipelineError::NotFound(self.pipeline_id.clone());
            self.fail(SessionFault::Pipeline {
                message: e.to_string(),
            });
            return Err(e.into());
        };

        self.transition(&[SessionState::Pending], SessionState::Starting);

        // Hardware setup is order-dependent and not assumed idempotent, so
        // the first failure aborts everything that follows.
        for setup in &pipeline.setup_commands {
            if let Err(e) = self.execute_setup_command(&pipeline, setup).await {
                tracing::error!(
                    "Session '{}' setup command '{}' ({}) failed: {}",
                    self.id,
                    setup.command.command,
                    setup.destination,
                    e
                );
                self.fail(SessionFault::SetupCommand {
                    command: setup.command.command.clone(),
                    destination: setup.destination.clone(),
                    message: e.to_string(),
                });
                self.pipelines.release(&self.pipeline_id);
                return Err(SessionError::SetupCommandFailed {
                    command: setup.command.command.clone(),
                    destination: setup.destination.clone(),
                    source: e,
                });
            }
        }

        if !self.transition(&[SessionState::Starting], SessionState::Active) {
            // Torn down while the last setup round trip was in flight; the
            // teardown owns the lock state now.
            self.pipelines.release(&self.pipeline_id);
            return Ok(());
        }

        if let Some(output_device) = pipeline.output_device() {
            self.telemetry
                .register_stream(&self.id, &self.pipeline_id, output_device);
        }

        tracing::info!(
            "Session '{}' active on pipeline '{}' for user '{}'",
            self.id,
            self.pipeline_id,
            self.user_id
        );
        Ok(())
    }

    async fn execute_setup_command(
        &self,
        pipeline: &Pipeline,
        setup: &crate::hardware::pipeline::SetupCommand,
    ) -> Result<CommandResponse, CommandError> {
        if setup.destination == "system" {
            return self.system_commands.handle(&setup.command).await;
        }

        // Validated at startup: every non-system destination names a device
        // bound to this pipeline.
        let device_id = setup
            .destination
            .split_once('.')
            .map(|(_, device)| device)
            .unwrap_or(&setup.destination);
        match pipeline.device(device_id) {
            Some(driver) => Ok(driver.execute_command(&setup.command).await?),
            None => Err(CommandError::UnknownDestination(setup.destination.clone())),
        }
    }

    /// Tear the session down: unregister telemetry, release the pipeline,
    /// finish in `Ended`. Valid from `Active` and `Starting` (a reservation
    /// cancelled mid-start) and a no-op from `Error` and `Ended`. A session
    /// that never got past `Pending` completes the same teardown; releasing
    /// a lock it never held is harmless.
    pub fn end(&self) {
        if !self.transition(
            &[
                SessionState::Pending,
                SessionState::Starting,
                SessionState::Active,
            ],
            SessionState::Ending,
        ) {
            return;
        }

        self.telemetry.unregister_stream(&self.id);
        self.pipelines.release(&self.pipeline_id);
        self.transition(&[SessionState::Ending], SessionState::Ended);
        tracing::info!("Session '{}' ended, pipeline '{}' freed", self.id, self.pipeline_id);
    }

    /// Route a command to a device in this session's pipeline. Only valid
    /// while `Active`; anything else is a routing failure for the caller,
    /// not a system fault.
    pub async fn deliver_command(
        &self,
        device_id: &str,
        command: &Command,
    ) -> Result<CommandResponse, SessionError> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(SessionError::NotActive {
                session: self.id.clone(),
                state,
            });
        }

        let driver = self
            .pipeline
            .as_ref()
            .and_then(|p| p.device(device_id))
            .ok_or_else(|| SessionError::UnknownDevice {
                pipeline: self.pipeline_id.clone(),
                device: device_id.to_string(),
            })?;

        let response = driver
            .execute_command(command)
            .await
            .map_err(CommandError::from)?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SystemCommandHandler;
    use crate::config::{DeviceBindingSpec, DeviceSpec, PipelineSpec, SetupCommandSpec};
    use crate::hardware::device::DeviceRegistry;
    use crate::hardware::manager::LockState;
    use crate::hardware::pipeline::PipelineMode;
    use crate::telemetry::RecordingTelemetrySink;
    use chrono::{TimeZone, Utc};

    fn reservation(id: &str, pipeline_id: &str) -> Reservation {
        Reservation {
            id: id.to_string(),
            pipeline_id: pipeline_id.to_string(),
            user_id: "op1".to_string(),
            start_time: Utc.timestamp_opt(100, 0).unwrap(),
            end_time: Utc.timestamp_opt(700, 0).unwrap(),
        }
    }

    fn pipeline_spec(id: &str, setup_commands: Vec<SetupCommandSpec>) -> PipelineSpec {
        PipelineSpec {
            id: id.to_string(),
            mode: PipelineMode::Transceive,
            description: None,
            hardware: vec![DeviceBindingSpec {
                device_id: "radio_a".to_string(),
                pipeline_input: false,
                pipeline_output: true,
            }],
            setup_commands,
        }
    }

    fn setup_command(command: &str, destination: &str) -> SetupCommandSpec {
        SetupCommandSpec {
            command: command.to_string(),
            destination: destination.to_string(),
            parameters: None,
        }
    }

    struct Fixture {
        pipelines: Arc<PipelineManager>,
        telemetry: Arc<RecordingTelemetrySink>,
        session: Session,
    }

    fn fixture(setup_commands: Vec<SetupCommandSpec>) -> Fixture {
        let registry = DeviceRegistry::from_config(&[DeviceSpec {
            device_id: "radio_a".to_string(),
            driver: "loopback".to_string(),
            settings: Default::default(),
        }])
        .unwrap();
        let pipelines = Arc::new(
            PipelineManager::from_config(&[pipeline_spec("uhf", setup_commands)], &registry)
                .unwrap(),
        );
        let telemetry = Arc::new(RecordingTelemetrySink::new());
        let session = Session::new(
            &reservation("r1", "uhf"),
            pipelines.clone(),
            Arc::new(SystemCommandHandler::new()),
            telemetry.clone(),
        );
        Fixture {
            pipelines,
            telemetry,
            session,
        }
    }

    #[tokio::test]
    async fn test_start_runs_setup_and_registers_telemetry() {
        let fx = fixture(vec![
            setup_command("station_time", "system"),
            setup_command("set_frequency", "uhf.radio_a"),
        ]);

        fx.session.start().await.unwrap();
        assert_eq!(fx.session.state(), SessionState::Active);
        assert_eq!(
            fx.pipelines.lock_state("uhf"),
            Some(LockState::LockedBy("r1".to_string()))
        );
        assert_eq!(fx.telemetry.events(), vec!["register r1 uhf.radio_a"]);
    }

    #[tokio::test]
    async fn test_setup_failure_aborts_and_releases() {
        // station_time succeeds, the bogus system command fails, the device
        // command must never run.
        let fx = fixture(vec![
            setup_command("station_time", "system"),
            setup_command("not_a_real_command", "system"),
            setup_command("set_frequency", "uhf.radio_a"),
        ]);

        let err = fx.session.start().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::SetupCommandFailed { ref command, .. } if command == "not_a_real_command"
        ));
        assert_eq!(fx.session.state(), SessionState::Error);
        assert_eq!(fx.pipelines.lock_state("uhf"), Some(LockState::Free));
        assert!(fx.telemetry.events().is_empty());

        let driver = fx.pipelines.lookup("uhf").unwrap().device("radio_a").unwrap();
        // Downcast not available through the trait; assert via state().
        assert_eq!(driver.state()["commands_executed"], 0);

        let status = fx.session.status();
        assert!(matches!(
            status.error,
            Some(SessionFault::SetupCommand { ref command, .. }) if command == "not_a_real_command"
        ));
    }

    #[tokio::test]
    async fn test_reserve_failure_is_session_error_without_release() {
        let fx = fixture(vec![]);
        fx.pipelines.reserve("uhf", "other").unwrap();

        let err = fx.session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Pipeline(PipelineError::InUse { .. })));
        assert_eq!(fx.session.state(), SessionState::Error);
        // The losing session must not have clobbered the holder's lock.
        assert_eq!(
            fx.pipelines.lock_state("uhf"),
            Some(LockState::LockedBy("other".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unknown_pipeline_reservation_fails_start() {
        let fx = fixture(vec![]);
        let session = Session::new(
            &reservation("r2", "ghost"),
            fx.pipelines.clone(),
            Arc::new(SystemCommandHandler::new()),
            Arc::new(RecordingTelemetrySink::new()),
        );

        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Pipeline(PipelineError::NotFound(ref id)) if id == "ghost"
        ));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_end_releases_and_unregisters() {
        let fx = fixture(vec![]);
        fx.session.start().await.unwrap();
        fx.session.end();

        assert_eq!(fx.session.state(), SessionState::Ended);
        assert_eq!(fx.pipelines.lock_state("uhf"), Some(LockState::Free));
        assert_eq!(
            fx.telemetry.events(),
            vec!["register r1 uhf.radio_a", "unregister r1"]
        );
    }

    #[tokio::test]
    async fn test_end_is_noop_from_error() {
        let fx = fixture(vec![setup_command("bogus", "system")]);
        let _ = fx.session.start().await;
        assert_eq!(fx.session.state(), SessionState::Error);

        fx.session.end();
        assert_eq!(fx.session.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_end_from_pending_reaches_ended() {
        let fx = fixture(vec![]);
        fx.session.end();
        assert_eq!(fx.session.state(), SessionState::Ended);
        assert_eq!(fx.pipelines.lock_state("uhf"), Some(LockState::Free));
    }

    #[tokio::test]
    async fn test_deliver_command_requires_active() {
        let fx = fixture(vec![]);

        let err = fx
            .session
            .deliver_command("radio_a", &Command::new("set_mode"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotActive { .. }));

        fx.session.start().await.unwrap();
        let response = fx
            .session
            .deliver_command("radio_a", &Command::new("set_mode"))
            .await
            .unwrap();
        assert_eq!(response.command, "set_mode");

        let err = fx
            .session
            .deliver_command("missing", &Command::new("set_mode"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownDevice { .. }));
    }
}
