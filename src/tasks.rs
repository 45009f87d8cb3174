//! Background coordination task.
//!
//! Runs the coordinator's tick on a fixed period so schedule refreshes and
//! reconciliation happen without any external prompting.

use crate::sessions::coordinator::SessionCoordinator;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct CoordinationTask {
    coordinator: Arc<SessionCoordinator>,
    period: Duration,
    handle: Option<JoinHandle<()>>,
}

impl CoordinationTask {
    pub fn new(coordinator: Arc<SessionCoordinator>, period: Duration) -> Self {
        Self {
            coordinator,
            period,
            handle: None,
        }
    }

    /// Start the periodic loop. An immediate first tick brings sessions up
    /// without waiting out the first period.
    pub async fn start(&mut self) {
        tracing::info!(
            "Starting coordination task (period: {:.0}s)",
            self.period.as_secs_f64()
        );

        self.coordinator.tick(Utc::now()).await;

        let coordinator = self.coordinator.clone();
        let period = self.period;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                coordinator.tick(Utc::now()).await;
            }
        });
        self.handle = Some(handle);
    }

    pub fn shutdown(mut self) {
        tracing::info!("Shutting down coordination task");
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
