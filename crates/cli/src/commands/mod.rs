pub mod onboard;
pub mod reconcile;
pub mod scope;
pub mod serve;
pub mod sweep;

use spendgate_config::AppConfig;
use spendgate_core::store::LedgerStore;
use spendgate_ledger::SqliteLedger;
use std::sync::Arc;

/// Load config and open the ledger it points at.
pub(crate) async fn open_store(
    config: &AppConfig,
) -> Result<Arc<dyn LedgerStore>, Box<dyn std::error::Error>> {
    let store = SqliteLedger::new(&config.database.path).await?;
    Ok(Arc::new(store))
}
