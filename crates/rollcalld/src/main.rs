use anyhow::{Context, Result};
use rollcall_core::{Attendance, AttendanceLedger, TemplateStore};
use rollcall_vision::OnnxProvider;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::{Bus, Config};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        store = %config.store_path.display(),
        ledger = %config.ledger_path.display(),
        tolerance = config.tolerance,
        match_mode = ?config.match_mode,
        bus = ?config.bus,
        "configuration loaded"
    );

    // Models and store load before the name is claimed so a broken
    // deployment never answers calls.
    let provider = OnnxProvider::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let store = TemplateStore::open(&config.store_path, config.on_corrupt_store)
        .with_context(|| format!("opening template store {}", config.store_path.display()))?;
    let ledger = AttendanceLedger::open(&config.ledger_path)
        .with_context(|| format!("opening attendance ledger {}", config.ledger_path.display()))?;

    let attendance = Arc::new(Attendance::new(
        Arc::new(provider),
        Arc::new(store),
        Arc::new(ledger),
        config.settings(),
    ));
    tracing::info!(templates = attendance.store().snapshot().len(), "gallery resident");

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RollcallService::new(attendance))?
        .build()
        .await
        .with_context(|| format!("claiming {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
