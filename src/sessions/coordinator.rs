//! Reconciles the reservation schedule against live sessions.
//!
//! The coordinator owns the live session table and is the only place where
//! sessions are created or retired. One `reconcile` pass runs at a time; the
//! periodic task and any on-demand caller serialize on the same gate, so the
//! session table and the pipeline locks only ever change one step at a time.

use crate::command::{Command, CommandHandler, CommandResponse};
use crate::hardware::manager::PipelineManager;
use crate::sessions::schedule::{Reservation, ScheduleManager};
use crate::sessions::session::{Session, SessionError, SessionState, SessionStatus};
use crate::telemetry::TelemetrySink;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct SessionCoordinator {
    schedule: Arc<ScheduleManager>,
    pipelines: Arc<PipelineManager>,
    system_commands: Arc<dyn CommandHandler>,
    telemetry: Arc<dyn TelemetrySink>,
    schedule_update_period: Duration,
    /// Live sessions, keyed by reservation id.
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    /// Reservations that already ran or failed while still inside their
    /// window. Consulted so a failed reservation is not retried until its
    /// window passes.
    closed: Mutex<HashMap<String, Arc<Session>>>,
    /// Serializes reconciliation passes.
    gate: tokio::sync::Mutex<()>,
}

impl SessionCoordinator {
    pub fn new(
        schedule: Arc<ScheduleManager>,
        pipelines: Arc<PipelineManager>,
        system_commands: Arc<dyn CommandHandler>,
        telemetry: Arc<dyn TelemetrySink>,
        schedule_update_period: Duration,
    ) -> Self {
        Self {
            schedule,
            pipelines,
            system_commands,
            telemetry,
            schedule_update_period,
            sessions: Mutex::new(HashMap::new()),
            closed: Mutex::new(HashMap::new()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// One coordination step: refresh the schedule if it has gone stale,
    /// then reconcile. This is what the periodic task drives.
    pub async fn tick(&self, now: DateTime<Utc>) {
        if self.schedule.is_stale(now, self.schedule_update_period) {
            if let Err(e) = self.schedule.refresh(now).await {
                // Never fatal; the retained snapshot keeps governing
                // reconciliation until a later refresh succeeds.
                tracing::error!("Schedule refresh failed, keeping previous snapshot: {}", e);
            }
        }
        self.reconcile(now).await;
    }

    /// Drive the session table toward the schedule: start a session for
    /// every current reservation that has none, end every session whose
    /// reservation has ended or disappeared, and retire terminal sessions.
    pub async fn reconcile(&self, now: DateTime<Utc>) {
        let _pass = self.gate.lock().await;

        let mut want_active = self.schedule.current_reservations(now);
        // Contenders for the same pipeline are processed earliest start
        // first (reservation id breaks ties), so the earlier reservation
        // reserves the pipeline and later ones observe InUse.
        want_active.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.id.cmp(&b.id))
        });

        for reservation in &want_active {
            if !self.is_known(&reservation.id) {
                self.start_session(reservation).await;
            }
        }

        self.retire_sessions(&want_active);

        // Closed entries only matter while their reservation is current.
        self.closed
            .lock()
            .unwrap()
            .retain(|id, _| want_active.iter().any(|r| &r.id == id));
    }

    fn is_known(&self, reservation_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(reservation_id)
            || self.closed.lock().unwrap().contains_key(reservation_id)
    }

    /// Create and start a session for a newly current reservation. The
    /// session is recorded whatever the outcome, so a failure is not retried
    /// within the same pass or the same reservation window.
    async fn start_session(&self, reservation: &Reservation) {
        tracing::info!(
            "Reservation '{}' is current, starting session on pipeline '{}'",
            reservation.id,
            reservation.pipeline_id
        );

        let session = Arc::new(Session::new(
            reservation,
            self.pipelines.clone(),
            self.system_commands.clone(),
            self.telemetry.clone(),
        ));
        self.sessions
            .lock()
            .unwrap()
            .insert(reservation.id.clone(), session.clone());

        // An individual session failure never aborts reconciliation of the
        // other reservations.
        if let Err(e) = session.start().await {
            tracing::error!("Session '{}' failed to start: {}", reservation.id, e);
        }
    }

    /// End sessions whose reservation vanished and retire terminal ones.
    fn retire_sessions(&self, want_active: &[Reservation]) {
        let live: Vec<Arc<Session>> = self.sessions.lock().unwrap().values().cloned().collect();

        for session in live {
            let current = want_active.iter().any(|r| r.id == session.id);
            let state = session.state();

            if current && !state.is_terminal() {
                continue;
            }

            // A starting session is left alone until its setup sequence
            // reaches a stable state; ending it now could free a lock the
            // in-flight setup still assumes it holds. It is picked up on the
            // next pass.
            if state == SessionState::Starting {
                continue;
            }

            if !state.is_terminal() {
                tracing::info!(
                    "Reservation '{}' is no longer current, ending its session",
                    session.id
                );
                session.end();
            }

            self.sessions.lock().unwrap().remove(&session.id);
            if current {
                // Terminal but still inside its window: remember it so the
                // reservation is not restarted.
                self.closed
                    .lock()
                    .unwrap()
                    .insert(session.id.clone(), session);
            }
        }
    }

    /// Resolve a `pipeline.device` address to the session currently owning
    /// that pipeline, for inbound command routing.
    pub fn find_session_for_device(
        &self,
        pipeline_id: &str,
        device_id: &str,
    ) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.pipeline_id() == pipeline_id && s.has_device(device_id))
            .cloned()
    }

    /// Deliver an already-validated command to the device's owning session.
    pub async fn deliver_command(
        &self,
        pipeline_id: &str,
        device_id: &str,
        command: &Command,
    ) -> Result<CommandResponse, SessionError> {
        let session = self
            .find_session_for_device(pipeline_id, device_id)
            .ok_or_else(|| SessionError::NoSession {
                pipeline: pipeline_id.to_string(),
                device: device_id.to_string(),
            })?;
        session.deliver_command(device_id, command).await
    }

    /// Status of every live session, for reporting.
    pub fn active_sessions(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|s| s.status())
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Status of sessions that already completed or failed inside their
    /// reservation window.
    pub fn closed_sessions(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> = self
            .closed
            .lock()
            .unwrap()
            .values()
            .map(|s| s.status())
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }
}
