use station_hwm::command::SystemCommandHandler;
use station_hwm::config::StationConfig;
use station_hwm::hardware::device::DeviceRegistry;
use station_hwm::hardware::manager::PipelineManager;
use station_hwm::logging;
use station_hwm::sessions::coordinator::SessionCoordinator;
use station_hwm::sessions::schedule::ScheduleManager;
use station_hwm::tasks::CoordinationTask;
use station_hwm::telemetry::LogTelemetrySink;

use anyhow::Context;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "station.toml".to_string());
    let config = StationConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from '{}'", config_path))?;

    let _logging_guard = logging::init_logging(&config.log_dir, "station-hwm", &config.log_level);

    tracing::info!("Station hardware manager starting...");
    tracing::info!(
        "Schedule source: {} ({})",
        config.schedule_location(),
        if config.offline_mode { "offline" } else { "network" }
    );

    // An invalid device or pipeline topology must abort startup.
    let devices = DeviceRegistry::from_config(&config.devices)
        .context("Device configuration is invalid")?;
    devices
        .initialize_all()
        .await
        .context("Device initialization failed")?;

    let pipelines = Arc::new(
        PipelineManager::from_config(&config.pipelines, &devices)
            .context("Pipeline configuration is invalid")?,
    );

    let schedule = Arc::new(ScheduleManager::from_config(&config));
    let coordinator = Arc::new(SessionCoordinator::new(
        schedule,
        pipelines,
        Arc::new(SystemCommandHandler::new()),
        Arc::new(LogTelemetrySink),
        config.schedule_update_period(),
    ));

    let mut coordination = CoordinationTask::new(coordinator, config.coordination_period());
    coordination.start().await;
    tracing::info!("Coordination task running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    coordination.shutdown();

    Ok(())
}
