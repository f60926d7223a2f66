use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod attendance_log;
mod config;
mod dbus_interface;
mod engine;
mod session;
#[cfg(test)]
mod testing;

use config::{BusKind, Config};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};
use engine::DeviceResources;
use session::{SessionError, SessionManager, SessionState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        model_dir = %config.model_dir.display(),
        detector = %config.detector_model.display(),
        threshold = ?config.distance_threshold,
        grace_ms = config.grace_period.as_millis() as u64,
        read_timeout_ms = config.read_timeout.as_millis() as u64,
        "configuration loaded"
    );
    if !config.grace_covers_read() {
        tracing::warn!(
            grace_ms = config.grace_period.as_millis() as u64,
            read_timeout_ms = config.read_timeout.as_millis() as u64,
            "grace period does not exceed the camera read timeout; stops will often time out"
        );
    }

    let sessions = Arc::new(SessionManager::new(
        Arc::new(DeviceResources::from_config(&config)),
        config.capture_settings(),
        config.grace_period,
    ));

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RollcallService::new(sessions.clone()))?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    if matches!(sessions.state(), SessionState::Running | SessionState::Ended) {
        sessions.quit_locally();
        match sessions.stop().await {
            Ok(report) => tracing::info!(
                session = %report.session_id,
                identities = ?report.identities,
                "session ended by shutdown; roster was not delivered to a caller"
            ),
            Err(SessionError::NotRunning) => {}
            Err(e) => tracing::warn!(error = %e, "failed to stop session on shutdown"),
        }
    }

    Ok(())
}
