//! `spendgate sweep` — One reclaim sweep, then exit.

use crate::commands::open_store;
use spendgate_config::AppConfig;
use spendgate_engine::{ExpirySweeper, ReservationEngine};
use std::sync::Arc;
use std::time::Duration;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let store = open_store(&config).await?;

    let engine = Arc::new(ReservationEngine::new(
        store,
        Duration::from_secs(config.reservations.ttl_secs),
    ));
    let sweeper = ExpirySweeper::new(
        engine,
        Duration::from_secs(config.reservations.sweep_interval_secs),
        config.reservations.sweep_batch,
    );

    let stats = sweeper.sweep_once().await?;
    println!(
        "Swept {} expired holds ({} examined, {} failures), returned ${}",
        stats.reclaimed, stats.examined, stats.failures, stats.returned_usd
    );
    Ok(())
}
