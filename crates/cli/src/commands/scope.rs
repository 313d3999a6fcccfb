//! `spendgate scope` — Inspect one scope's balances.

use crate::commands::open_store;
use chrono::Utc;
use spendgate_config::AppConfig;
use spendgate_core::{period_for, ScopeKind, ScopeRef};

pub async fn run(kind: &str, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let kind: ScopeKind = kind.parse()?;
    let config = AppConfig::load()?;
    let store = open_store(&config).await?;

    let scope_ref = ScopeRef::new(kind, id);
    let period = period_for(Utc::now());

    match store.fetch_scope(&scope_ref, period).await? {
        Some(scope) => {
            println!("{scope_ref} (period {period})");
            println!("  limit:     ${}", scope.limit_usd);
            println!("  overdraft: ${}", scope.overdraft_usd);
            println!("  used:      ${}", scope.used_usd);
            println!("  reserved:  ${}", scope.reserved_usd);
            println!("  remaining: ${}", scope.remaining_usd());
            if let Some(at) = scope.last_alert_at {
                println!("  last alert: {at}");
            }
        }
        None => {
            println!("No ledger row for {scope_ref} in period {period}.");
            println!("Scopes are created lazily on first reservation.");
        }
    }
    Ok(())
}
