use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod service;

use dbus_interface::{FaceFinderInterface, BUS_NAME, OBJECT_PATH};
use service::{FaceFinderService, ServiceSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facefinderd starting");

    let config = config::Config::load()?;
    let settings = ServiceSettings::from_config(&config)?;

    let oracle = facefinder_core::OnnxOracle::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    tracing::info!(dir = %config.model_dir.display(), "models loaded");

    let engine = engine::spawn_engine(oracle, config.cache_capacity)?;

    let store = facefinder_store::SessionStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;

    let service = Arc::new(FaceFinderService::new(store.clone(), engine, settings));

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FaceFinderInterface::new(service))?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(
        bus = BUS_NAME,
        path = OBJECT_PATH,
        downscale = config.downscale_factor,
        timeout_secs = config.match_timeout_secs,
        "facefinderd ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("facefinderd shutting down");
    if let Err(e) = store.close().await {
        tracing::warn!(error = %e, "failed to close session store");
    }

    Ok(())
}
