use anyhow::{Context, Result};
use rollcall_core::{MemberStore, RecognitionSession, SessionError};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        policy = ?config.policy,
        "rollcalld starting"
    );

    let store: Arc<dyn MemberStore> = if config.in_memory_db() {
        tracing::warn!("using in-memory database; attendance will not persist");
        Arc::new(SqliteStore::open_in_memory().await?)
    } else {
        Arc::new(
            SqliteStore::open(&config.db_path)
                .await
                .with_context(|| format!("failed to open {}", config.db_path.display()))?,
        )
    };

    let session = Arc::new(RecognitionSession::new(store.clone(), config.session_config()));
    let members = session.refresh_roster().await?;
    tracing::info!(members, "roster loaded");

    let service = AttendanceService::new(session.clone(), store, Arc::new(config));
    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    let iface = conn
        .object_server()
        .interface::<_, AttendanceService>(OBJECT_PATH)
        .await?;
    let forwarder = tokio::spawn(dbus_interface::forward_signals(
        iface.signal_emitter().clone(),
        session.subscribe(),
    ));

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    match session.stop().await {
        Ok(()) | Err(SessionError::NotRunning) => {}
        Err(e) => tracing::warn!(error = %e, "failed to stop session"),
    }
    forwarder.abort();

    Ok(())
}
