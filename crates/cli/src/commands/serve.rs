//! `spendgate serve` — Start the admission gateway.

use spendgate_config::AppConfig;

pub async fn run(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load()?;
    if let Some(port) = port {
        config.gateway.port = port;
    }
    config.validate()?;

    tracing::info!(
        db = %config.database.path,
        teams = config.teams.len(),
        keys = config.keys.len(),
        "Starting spendgate"
    );
    spendgate_gateway::start(config).await?;
    Ok(())
}
