//! `spendgate reconcile` — Drift audit over reserved balances.

use crate::commands::open_store;
use spendgate_config::AppConfig;
use spendgate_engine::Reconciler;

pub async fn run(fix: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let store = open_store(&config).await?;

    let report = Reconciler::new(store).run(fix).await?;

    if report.is_clean() {
        println!("{} scopes checked, no drift", report.scopes_checked);
        return Ok(());
    }

    println!(
        "{} scopes checked, {} drifted:",
        report.scopes_checked,
        report.drifted.len()
    );
    for drift in &report.drifted {
        println!(
            "  {} (period {}): recorded ${}, actual ${}{}",
            drift.scope,
            drift.period,
            drift.recorded_usd,
            drift.actual_usd,
            if drift.fixed { " — healed" } else { "" }
        );
    }
    if !fix {
        println!("\nRe-run with --fix to heal from the reservation table.");
    }
    Ok(())
}
