//! Reservation schedule cache.
//!
//! The schedule is owned by the user-interface side of the system; this
//! process only keeps a periodically refreshed copy. A refresh failure is
//! never fatal and never clears known-good state: the previous snapshot
//! stays in force until a later refresh succeeds.

use chrono::{serde::ts_seconds, DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("could not read schedule file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("could not download schedule from '{url}': {source}")]
    Fetch { url: String, source: reqwest::Error },
    #[error("schedule download timed out after {0:?}")]
    Timeout(Duration),
    #[error("schedule record is not valid: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One scheduled time window granting a user exclusive use of a pipeline.
/// Immutable once read from a snapshot; identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    #[serde(rename = "reservation_id")]
    pub id: String,
    pub pipeline_id: String,
    pub user_id: String,
    #[serde(rename = "time_start", with = "ts_seconds")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "time_end", with = "ts_seconds")]
    pub end_time: DateTime<Utc>,
}

impl Reservation {
    /// Whether `[start_time, end_time)` contains `now`.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now < self.end_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSource {
    Local,
    Network,
}

/// The full set of reservations known as of the last successful refresh.
/// Replaced wholesale; never edited in place.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSnapshot {
    pub reservations: Vec<Reservation>,
    pub fetched_at: DateTime<Utc>,
    pub source: ScheduleSource,
}

impl ScheduleSnapshot {
    fn empty(source: ScheduleSource) -> Self {
        Self {
            reservations: Vec::new(),
            fetched_at: DateTime::<Utc>::MIN_UTC,
            source,
        }
    }
}

/// Wire shape of the schedule record served by the user interface (and
/// mirrored by the offline schedule file).
#[derive(Debug, Deserialize)]
struct ScheduleDocument {
    #[allow(dead_code)]
    generated_at: f64,
    reservations: Vec<Reservation>,
}

/// Maintains the current [`ScheduleSnapshot`].
pub struct ScheduleManager {
    offline_mode: bool,
    local_path: PathBuf,
    network_url: String,
    fetch_timeout: Duration,
    client: Client,
    snapshot: Mutex<ScheduleSnapshot>,
    last_updated: Mutex<Option<DateTime<Utc>>>,
}

impl ScheduleManager {
    pub fn new(
        offline_mode: bool,
        local_path: impl Into<PathBuf>,
        network_url: impl Into<String>,
        fetch_timeout: Duration,
    ) -> Self {
        let source = if offline_mode {
            ScheduleSource::Local
        } else {
            ScheduleSource::Network
        };

        Self {
            offline_mode,
            local_path: local_path.into(),
            network_url: network_url.into(),
            fetch_timeout,
            client: Client::builder()
                .timeout(fetch_timeout)
                .build()
                .expect("Failed to build reqwest client"),
            snapshot: Mutex::new(ScheduleSnapshot::empty(source)),
            last_updated: Mutex::new(None),
        }
    }

    pub fn from_config(config: &crate::config::StationConfig) -> Self {
        Self::new(
            config.offline_mode,
            config.schedule_location_local.clone(),
            config.schedule_location_network.clone(),
            config.schedule_update_timeout(),
        )
    }

    /// Load the most recent schedule from the active source and replace the
    /// snapshot. On any failure the existing snapshot is left untouched.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let (raw, source) = if self.offline_mode {
            (self.load_local().await?, ScheduleSource::Local)
        } else {
            (self.fetch_network().await?, ScheduleSource::Network)
        };

        let document: ScheduleDocument = serde_json::from_str(&raw)?;

        let snapshot = ScheduleSnapshot {
            reservations: document.reservations,
            fetched_at: now,
            source,
        };

        tracing::info!(
            "Schedule refreshed: {} reservations ({:?})",
            snapshot.reservations.len(),
            source
        );

        *self.snapshot.lock().unwrap() = snapshot;
        *self.last_updated.lock().unwrap() = Some(now);

        Ok(())
    }

    async fn load_local(&self) -> Result<String, ScheduleError> {
        tokio::fs::read_to_string(&self.local_path)
            .await
            .map_err(|source| ScheduleError::Read {
                path: self.local_path.display().to_string(),
                source,
            })
    }

    async fn fetch_network(&self) -> Result<String, ScheduleError> {
        let request = async {
            let response = self
                .client
                .get(&self.network_url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|source| ScheduleError::Fetch {
                    url: self.network_url.clone(),
                    source,
                })?;

            response.text().await.map_err(|source| ScheduleError::Fetch {
                url: self.network_url.clone(),
                source,
            })
        };

        // The client carries its own timeout; this outer bound also covers
        // connection setup stalls.
        match tokio::time::timeout(self.fetch_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(ScheduleError::Timeout(self.fetch_timeout)),
        }
    }

    /// Every reservation whose window contains `now`.
    pub fn current_reservations(&self, now: DateTime<Utc>) -> Vec<Reservation> {
        self.snapshot
            .lock()
            .unwrap()
            .reservations
            .iter()
            .filter(|r| r.is_current(now))
            .cloned()
            .collect()
    }

    /// The full cached snapshot, for diagnostics.
    pub fn all_reservations(&self) -> ScheduleSnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        *self.last_updated.lock().unwrap()
    }

    /// Whether the cache is due for a refresh as of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, period: Duration) -> bool {
        match self.last_updated() {
            Some(updated) => {
                now.signed_duration_since(updated)
                    >= chrono::Duration::from_std(period).unwrap_or(chrono::Duration::MAX)
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::TempDir;

    fn schedule_json(reservations: &[(&str, &str, i64, i64)]) -> String {
        let entries: Vec<serde_json::Value> = reservations
            .iter()
            .map(|(id, pipeline, start, end)| {
                serde_json::json!({
                    "reservation_id": id,
                    "pipeline_id": pipeline,
                    "user_id": "op1",
                    "time_start": start,
                    "time_end": end,
                })
            })
            .collect();
        serde_json::json!({ "generated_at": 1_700_000_000, "reservations": entries }).to_string()
    }

    fn write_schedule(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("offline_schedule.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    fn offline_manager(path: &std::path::Path) -> ScheduleManager {
        ScheduleManager::new(true, path, "https://unused", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = write_schedule(&dir, &schedule_json(&[("r1", "uhf", 100, 700)]));
        let manager = offline_manager(&path);

        let now = Utc.timestamp_opt(150, 0).unwrap();
        manager.refresh(now).await.unwrap();

        let snapshot = manager.all_reservations();
        assert_eq!(snapshot.reservations.len(), 1);
        assert_eq!(snapshot.source, ScheduleSource::Local);
        assert_eq!(manager.last_updated(), Some(now));
    }

    #[tokio::test]
    async fn test_current_reservations_window_is_half_open() {
        let dir = TempDir::new().unwrap();
        let path = write_schedule(&dir, &schedule_json(&[("r1", "uhf", 100, 700)]));
        let manager = offline_manager(&path);
        manager.refresh(Utc.timestamp_opt(90, 0).unwrap()).await.unwrap();

        let current = |secs: i64| manager.current_reservations(Utc.timestamp_opt(secs, 0).unwrap());
        assert!(current(99).is_empty());
        assert_eq!(current(100).len(), 1); // inclusive start
        assert_eq!(current(699).len(), 1);
        assert!(current(700).is_empty()); // exclusive end
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = write_schedule(&dir, &schedule_json(&[("r1", "uhf", 100, 700)]));
        let manager = offline_manager(&path);

        let first = Utc.timestamp_opt(150, 0).unwrap();
        manager.refresh(first).await.unwrap();

        // Corrupt the file; the next refresh must fail without clearing state.
        std::fs::write(&path, "{ not json").unwrap();
        let err = manager.refresh(Utc.timestamp_opt(200, 0).unwrap()).await.unwrap_err();
        assert!(matches!(err, ScheduleError::Parse(_)));

        assert_eq!(manager.all_reservations().reservations.len(), 1);
        assert_eq!(manager.last_updated(), Some(first));
    }

    #[tokio::test]
    async fn test_missing_local_schedule_is_read_error() {
        let dir = TempDir::new().unwrap();
        let manager = offline_manager(&dir.path().join("missing.json"));
        let err = manager.refresh(Utc::now()).await.unwrap_err();
        assert!(matches!(err, ScheduleError::Read { .. }));
        assert!(manager.current_reservations(Utc::now()).is_empty());
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_parse_error() {
        let dir = TempDir::new().unwrap();
        // Valid JSON, wrong shape: reservations entries missing fields.
        let path = write_schedule(
            &dir,
            r#"{ "generated_at": 1, "reservations": [{ "reservation_id": "r1" }] }"#,
        );
        let manager = offline_manager(&path);
        let err = manager.refresh(Utc::now()).await.unwrap_err();
        assert!(matches!(err, ScheduleError::Parse(_)));
    }

    #[test]
    fn test_staleness() {
        let manager = ScheduleManager::new(
            true,
            "unused.json",
            "https://unused",
            Duration::from_secs(5),
        );
        let now = Utc.timestamp_opt(1000, 0).unwrap();
        assert!(manager.is_stale(now, Duration::from_secs(60)));

        *manager.last_updated.lock().unwrap() = Some(now);
        assert!(!manager.is_stale(now + chrono::Duration::seconds(59), Duration::from_secs(60)));
        assert!(manager.is_stale(now + chrono::Duration::seconds(60), Duration::from_secs(60)));
    }
}
