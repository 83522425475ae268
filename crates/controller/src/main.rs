//! Controller process entry point: reads env/config, connects to SQLite,
//! wires up the valve and environment backends, and runs the supervised
//! tick loop until a shutdown signal arrives.

use std::env;
use std::sync::Arc;

use anyhow::Result;
use irrigation_controller::config;
use irrigation_controller::controller::Controller;
use irrigation_controller::env::{EnvPort, StaleGuardReader, DEFAULT_MAX_SENSOR_AGE_SECS};
use irrigation_controller::persistence::{self, SqliteStore, Store};
use irrigation_controller::pulse::{PulseCounter, DEFAULT_DEBOUNCE_MS};
use irrigation_controller::valve::ValvePort;
use tracing::{error, info, warn};

#[cfg(feature = "sim")]
use irrigation_controller::env::SimEnvReader;
#[cfg(feature = "sim")]
use irrigation_controller::valve::SimValveBoard;

#[cfg(feature = "hw")]
use irrigation_controller::valve::GpioValveBoard;

/// Default backup cadence (30 minutes), matching the SD-card wear budget
/// this deployment target was sized for.
const DEFAULT_DB_BACKUP_INTERVAL_SEC: u64 = 1800;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let db_backup_path = env::var("DB_BACKUP_PATH").ok().filter(|s| !s.is_empty());
    let db_backup_interval: u64 = env::var("DB_BACKUP_INTERVAL_SEC")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_DB_BACKUP_INTERVAL_SEC);

    // tmpfs-backed working directories lose the db file on reboot — restore
    // from the persistent backup, if any, before connecting.
    if let (Some(working_path), Some(ref backup)) = (persistence::db_file_path(&db_url), &db_backup_path) {
        match persistence::restore_from_backup(&working_path, backup) {
            Ok(true) => info!(backup = %backup, "database restored from backup"),
            Ok(false) => {}
            Err(e) => warn!("backup restore failed (starting fresh): {e:#}"),
        }
    }

    let sqlite_store = SqliteStore::connect(&db_url).await?;
    sqlite_store.migrate().await?;
    // Kept alongside the trait object: backups run `VACUUM INTO`, a
    // SQLite-specific operation that has no reason to live on `Store`.
    let backup_store = sqlite_store.clone();
    let store: Arc<dyn Store> = Arc::new(sqlite_store);

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let max_sensor_age_secs = match config::load(&config_path) {
        Ok(cfg) => {
            let age_secs = config::max_sensor_age_secs(&cfg);
            config::apply(&cfg, store.as_ref()).await?;
            age_secs
        }
        Err(e) => {
            warn!("config load failed, continuing with persisted channel state only: {e:#}");
            DEFAULT_MAX_SENSOR_AGE_SECS
        }
    };

    let valve: Box<dyn ValvePort> = build_valve()?;
    let env_port: Box<dyn EnvPort> = build_env(max_sensor_age_secs)?;
    let pulses = Arc::new(PulseCounter::new(DEFAULT_DEBOUNCE_MS));

    let controller = Controller::new(valve, env_port, Arc::clone(&store), pulses).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let run_handle = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller.run_supervised(shutdown_rx).await;
        })
    };

    let backup_handle = {
        let backup_store = backup_store.clone();
        let backup_dest = db_backup_path.clone();
        tokio::spawn(async move {
            let Some(dest) = backup_dest else {
                std::future::pending::<()>().await;
                return;
            };
            tokio::time::sleep(std::time::Duration::from_secs(120)).await;
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(db_backup_interval));
            loop {
                ticker.tick().await;
                match backup_store.backup(&dest).await {
                    Ok(()) => info!(path = %dest, "database backup complete"),
                    Err(e) => error!("database backup failed: {e:#}"),
                }
            }
        })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason = tokio::select! {
        _ = &mut ctrl_c => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    warn!(signal = exit_reason, "shutting down");
    let _ = shutdown_tx.send(());
    backup_handle.abort();
    let _ = run_handle.await;

    if let Some(ref dest) = db_backup_path {
        match backup_store.backup(dest).await {
            Ok(()) => info!(path = %dest, "final database backup complete"),
            Err(e) => error!("final database backup failed: {e:#}"),
        }
    }

    info!("shutdown complete");
    Ok(())
}

#[cfg(feature = "sim")]
fn build_valve() -> Result<Box<dyn ValvePort>> {
    #[cfg(feature = "hw")]
    {
        if env::var("IRRIGATION_HW").ok().as_deref() == Some("1") {
            return build_hw_valve();
        }
    }
    Ok(Box::new(SimValveBoard::new()))
}

#[cfg(not(feature = "sim"))]
fn build_valve() -> Result<Box<dyn ValvePort>> {
    build_hw_valve()
}

#[cfg(feature = "hw")]
fn build_hw_valve() -> Result<Box<dyn ValvePort>> {
    let pins: [u8; 8] = [17, 27, 22, 23, 24, 25, 5, 6];
    Ok(Box::new(GpioValveBoard::new(pins)?))
}

#[cfg(not(feature = "hw"))]
fn build_hw_valve() -> Result<Box<dyn ValvePort>> {
    anyhow::bail!("neither the `sim` nor `hw` feature is enabled; nothing to drive the valve board")
}

#[cfg(feature = "sim")]
fn build_env(max_sensor_age_secs: i64) -> Result<Box<dyn EnvPort>> {
    let inner: Box<dyn EnvPort> = Box::new(SimEnvReader::new(20.0, 55.0, 1013.0));
    Ok(Box::new(StaleGuardReader::new(inner, max_sensor_age_secs)))
}

#[cfg(not(feature = "sim"))]
fn build_env(_max_sensor_age_secs: i64) -> Result<Box<dyn EnvPort>> {
    anyhow::bail!("no environment reader backend available without the `sim` feature")
}
