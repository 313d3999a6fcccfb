//! Reconciliation audit: do the scope rows agree with the holds?
//!
//! For every scope carrying a reserved balance, the sum of
//! `reserved_usd` over its status=active reservations is the ground
//! truth. A scope row that disagrees beyond tolerance has drifted —
//! typically the residue of a crash between partial fixes or manual
//! surgery — and can optionally be healed from the reservation table.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use spendgate_core::error::Result;
use spendgate_core::store::LedgerStore;
use spendgate_core::ScopeRef;
use std::sync::Arc;
use tracing::{info, warn};

/// 1e-6 USD — differences below this are rounding noise, not drift.
fn drift_tolerance() -> Decimal {
    Decimal::new(1, 6)
}

/// One scope whose recorded reserved balance disagrees with its
/// active reservations.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeDrift {
    pub scope: ScopeRef,
    pub period: NaiveDate,
    /// What the scope row says is reserved.
    pub recorded_usd: Decimal,
    /// What the active reservations actually sum to.
    pub actual_usd: Decimal,
    /// Whether this pass overwrote the scope row.
    pub fixed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub scopes_checked: usize,
    pub drifted: Vec<ScopeDrift>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty()
    }
}

/// Operator-invoked drift audit over all scopes with holds.
pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Audit every scope carrying a reserved balance; with `fix`,
    /// overwrite drifted rows from the reservation table.
    pub async fn run(&self, fix: bool) -> Result<ReconcileReport> {
        let scopes = self.store.scopes_with_holds().await?;
        let mut report = ReconcileReport {
            scopes_checked: scopes.len(),
            ..ReconcileReport::default()
        };

        for scope in &scopes {
            let scope_ref = scope.scope_ref();
            let actual = self.store.active_hold_total(&scope_ref).await?;
            let delta = (scope.reserved_usd - actual).abs();
            if delta <= drift_tolerance() {
                continue;
            }

            warn!(
                scope = %scope_ref,
                period = %scope.period_start,
                recorded = %scope.reserved_usd,
                actual = %actual,
                "Reserved balance drift detected"
            );

            if fix {
                self.store
                    .override_reserved(&scope_ref, scope.period_start, actual)
                    .await?;
                info!(scope = %scope_ref, healed_to = %actual, "Drift healed from reservation table");
            }

            report.drifted.push(ScopeDrift {
                scope: scope_ref,
                period: scope.period_start,
                recorded_usd: scope.reserved_usd,
                actual_usd: actual,
                fixed: fix,
            });
        }

        info!(
            checked = report.scopes_checked,
            drifted = report.drifted.len(),
            fix,
            "Reconciliation pass complete"
        );
        Ok(report)
    }
}
