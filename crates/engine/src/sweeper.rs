//! The expiry sweep — the crash-recovery backstop.
//!
//! A reservation is a lease on budget capacity. When a request dies
//! between reserve and commit/release, its lease eventually expires and
//! this sweeper reverses it, returning the held funds to the scopes.
//! Races with a late commit or release are benign: whoever reaches the
//! reservation first wins, the loser observes a terminal status.

use crate::engine::ReservationEngine;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use spendgate_core::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What one sweep cycle accomplished.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStats {
    /// Expired reservations the scan returned.
    pub examined: usize,
    /// Reservations actually reversed by this sweep.
    pub reclaimed: usize,
    /// Total USD returned to scopes.
    pub returned_usd: Decimal,
    /// Rows that failed to reverse and were skipped.
    pub failures: usize,
}

/// Periodic task that reclaims expired reservations.
pub struct ExpirySweeper {
    engine: Arc<ReservationEngine>,
    interval: Duration,
    batch: u32,
}

impl ExpirySweeper {
    pub fn new(engine: Arc<ReservationEngine>, interval: Duration, batch: u32) -> Self {
        Self {
            engine,
            interval,
            batch,
        }
    }

    /// Run the sweep loop until the shutdown signal flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch = self.batch,
            "Expiry sweeper started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup isn't a sweep.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(stats) if stats.reclaimed > 0 || stats.failures > 0 => {
                            info!(
                                reclaimed = stats.reclaimed,
                                returned_usd = %stats.returned_usd,
                                failures = stats.failures,
                                "Sweep cycle complete"
                            );
                        }
                        Ok(_) => debug!("Sweep cycle found nothing to reclaim"),
                        Err(e) => warn!(error = %e, "Sweep cycle failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Expiry sweeper stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One sweep cycle. A failure on one row is logged and skipped —
    /// it must never block reclaiming the others.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let now = Utc::now();
        let expired = self.engine.expired_holds(now, self.batch).await?;

        let mut stats = SweepStats {
            examined: expired.len(),
            ..SweepStats::default()
        };

        for reservation in &expired {
            match self.engine.reclaim(reservation).await {
                Ok(amount) if amount > Decimal::ZERO => {
                    stats.reclaimed += 1;
                    stats.returned_usd += amount;
                }
                // A live commit/release won the race — nothing to return
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        request_id = %reservation.request_id,
                        error = %e,
                        "Failed to reclaim expired reservation, skipping"
                    );
                    stats.failures += 1;
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use spendgate_core::store::LedgerStore;
    use spendgate_core::{
        BudgetMode, ScopeChain, ScopeKind, ScopeRef, ScopeSpec, period_for,
    };
    use spendgate_ledger::SqliteLedger;

    async fn engine() -> Arc<ReservationEngine> {
        let store: Arc<dyn LedgerStore> =
            Arc::new(SqliteLedger::new("sqlite::memory:").await.unwrap());
        Arc::new(ReservationEngine::new(store, Duration::from_secs(900)))
    }

    fn chain() -> ScopeChain {
        ScopeChain {
            team_id: "acme".into(),
            key_id: "vk-1".into(),
            scopes: vec![
                ScopeSpec {
                    kind: ScopeKind::Key,
                    id: "vk-1".into(),
                    limit_usd: dec!(5),
                    overdraft_usd: Decimal::ZERO,
                },
                ScopeSpec {
                    kind: ScopeKind::Team,
                    id: "acme".into(),
                    limit_usd: dec!(25),
                    overdraft_usd: Decimal::ZERO,
                },
            ],
            mode: BudgetMode::Hard,
        }
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_holds_exactly() {
        let engine = engine().await;
        let chain = chain();

        // One hold already past expiry, one still live
        engine
            .inject_hold(
                "req-dead",
                &chain,
                dec!(0.03),
                Utc::now() - ChronoDuration::minutes(1),
            )
            .await
            .unwrap();
        engine
            .reserve("req-live", &chain, dec!(0.02), false)
            .await
            .unwrap();

        let sweeper = ExpirySweeper::new(Arc::clone(&engine), Duration::from_secs(60), 100);
        let stats = sweeper.sweep_once().await.unwrap();

        assert_eq!(stats.examined, 1);
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.returned_usd, dec!(0.03));
        assert_eq!(stats.failures, 0);

        // Exactly the dead hold's amount came back; the live hold stays
        let scope = engine
            .store()
            .fetch_scope(&ScopeRef::new(ScopeKind::Team, "acme"), period_for(Utc::now()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scope.reserved_usd, dec!(0.02));
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let engine = engine().await;
        engine
            .inject_hold(
                "req-dead",
                &chain(),
                dec!(0.03),
                Utc::now() - ChronoDuration::minutes(1),
            )
            .await
            .unwrap();

        let sweeper = ExpirySweeper::new(Arc::clone(&engine), Duration::from_secs(60), 100);
        sweeper.sweep_once().await.unwrap();
        let second = sweeper.sweep_once().await.unwrap();

        assert_eq!(second.examined, 0);
        assert_eq!(second.returned_usd, Decimal::ZERO);
    }

    #[tokio::test]
    async fn sweep_respects_batch_limit() {
        let engine = engine().await;
        let chain = chain();
        for i in 0..5 {
            engine
                .inject_hold(
                    &format!("req-{i}"),
                    &chain,
                    dec!(0.01),
                    Utc::now() - ChronoDuration::minutes(1),
                )
                .await
                .unwrap();
        }

        let sweeper = ExpirySweeper::new(Arc::clone(&engine), Duration::from_secs(60), 2);
        let stats = sweeper.sweep_once().await.unwrap();
        assert_eq!(stats.reclaimed, 2);

        let stats = sweeper.sweep_once().await.unwrap();
        assert_eq!(stats.reclaimed, 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let engine = engine().await;
        let sweeper = ExpirySweeper::new(engine, Duration::from_secs(3600), 100);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { sweeper.run(rx).await });
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
