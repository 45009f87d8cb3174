//! Seam between sessions and the telemetry/data transport layer.
//!
//! Wire framing and TLS live outside this crate. Sessions only need to
//! announce which pipeline output stream belongs to which session.

use std::sync::Mutex;

/// Callback surface invoked when a session becomes active or begins teardown.
pub trait TelemetrySink: Send + Sync {
    /// Associate the pipeline's output-device stream with the session.
    fn register_stream(&self, session_id: &str, pipeline_id: &str, device_id: &str);

    /// Drop any stream association held for the session. Must tolerate being
    /// called for a session that never registered.
    fn unregister_stream(&self, session_id: &str);
}

/// Default sink for processes without a connected transport: registrations
/// are only logged.
pub struct LogTelemetrySink;

impl TelemetrySink for LogTelemetrySink {
    fn register_stream(&self, session_id: &str, pipeline_id: &str, device_id: &str) {
        tracing::info!(
            "Telemetry stream registered: session '{}' -> {}.{}",
            session_id,
            pipeline_id,
            device_id
        );
    }

    fn unregister_stream(&self, session_id: &str) {
        tracing::info!("Telemetry stream unregistered: session '{}'", session_id);
    }
}

/// Test sink that records registration calls in order.
#[derive(Default)]
pub struct RecordingTelemetrySink {
    pub events: Mutex<Vec<String>>,
}

impl RecordingTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingTelemetrySink {
    fn register_stream(&self, session_id: &str, pipeline_id: &str, device_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("register {} {}.{}", session_id, pipeline_id, device_id));
    }

    fn unregister_stream(&self, session_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("unregister {}", session_id));
    }
}
