//! The durable ledger seam.
//!
//! `LedgerStore` is the only way any component touches scope balances.
//! Its methods are whole operations: an implementation applies each one
//! atomically (all scopes and the reservation row together) or not at
//! all. Callers own the check-then-act window via per-scope locking;
//! the store owns durability.

use crate::error::LedgerError;
use crate::reservation::{Reservation, ReservationStatus};
use crate::scope::{BudgetScope, ScopeRef, ScopeSpec};
use crate::usage::{UsageEvent, UsageRollup};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

/// Result of attempting to place a hold across a scope chain.
#[derive(Debug, Clone)]
pub enum HoldOutcome {
    /// The hold was placed on every scope. `breaches` lists scopes that
    /// failed the headroom test while the hold was applied anyway
    /// (warn mode / streaming soft reservations).
    Held {
        scopes: Vec<BudgetScope>,
        breaches: Vec<ScopeRef>,
    },
    /// Enforcement rejected the hold; no scope was modified.
    Rejected {
        scope: ScopeRef,
        used: Decimal,
        remaining: Decimal,
        limit: Decimal,
    },
}

/// Result of settling a reservation into permanent usage.
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// Hold reversed, usage charged, event and rollup written.
    Settled { scopes: Vec<BudgetScope> },
    /// The reservation already left `Active` — nothing was changed.
    AlreadyTerminal { status: ReservationStatus },
    NotFound,
}

/// Result of releasing (or reclaiming) a reservation.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    /// The hold was reversed; `amount` is exactly what was held.
    Released { amount: Decimal },
    AlreadyTerminal { status: ReservationStatus },
    NotFound,
}

/// Durable record of scopes, reservations, usage events, and rollups.
///
/// Implementations must guarantee that each method is atomic and that
/// `request_id` uniqueness on reservations and usage events is enforced
/// by the storage layer itself, not by callers.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Fetch a scope row if it exists for the given period.
    async fn fetch_scope(
        &self,
        scope: &ScopeRef,
        period: NaiveDate,
    ) -> Result<Option<BudgetScope>, LedgerError>;

    /// Fetch a scope row, creating it from the policy spec when absent.
    async fn ensure_scope(
        &self,
        spec: &ScopeSpec,
        period: NaiveDate,
    ) -> Result<BudgetScope, LedgerError>;

    /// Look up the reservation for a request, whatever its status.
    async fn find_reservation(
        &self,
        request_id: &str,
    ) -> Result<Option<Reservation>, LedgerError>;

    /// Atomically test every scope in the chain and either debit
    /// `reservation.reserved_usd` from all of them and insert the
    /// reservation row, or (when `enforce`) modify nothing.
    async fn place_hold(
        &self,
        reservation: &Reservation,
        chain: &[ScopeSpec],
        period: NaiveDate,
        enforce: bool,
    ) -> Result<HoldOutcome, LedgerError>;

    /// Atomically settle an active reservation: reverse the hold using
    /// the original estimate, charge `event.cost_usd` to `used_usd`,
    /// insert the usage event, merge the daily rollup, and mark the
    /// reservation committed.
    async fn settle_hold(
        &self,
        request_id: &str,
        event: &UsageEvent,
    ) -> Result<SettleOutcome, LedgerError>;

    /// Atomically reverse an active hold without recording usage.
    async fn release_hold(&self, request_id: &str) -> Result<ReleaseOutcome, LedgerError>;

    /// Active reservations whose expiry has passed, oldest first.
    async fn expired_holds(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Reservation>, LedgerError>;

    /// Stamp `last_alert_at` on a scope row.
    async fn stamp_alert(
        &self,
        scope: &ScopeRef,
        period: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// Scopes currently carrying a non-zero reserved balance.
    async fn scopes_with_holds(&self) -> Result<Vec<BudgetScope>, LedgerError>;

    /// Sum of `reserved_usd` over status=active reservations targeting
    /// the scope — the reconciliation ground truth.
    async fn active_hold_total(&self, scope: &ScopeRef) -> Result<Decimal, LedgerError>;

    /// Overwrite a scope's reserved balance. Drift healing only.
    async fn override_reserved(
        &self,
        scope: &ScopeRef,
        period: NaiveDate,
        reserved_usd: Decimal,
    ) -> Result<(), LedgerError>;

    /// The usage event settled for a request, if any.
    async fn usage_event(&self, request_id: &str) -> Result<Option<UsageEvent>, LedgerError>;

    /// The daily rollup row for (day, team, key), if any.
    async fn rollup(
        &self,
        day: NaiveDate,
        team_id: &str,
        key_id: &str,
    ) -> Result<Option<UsageRollup>, LedgerError>;
}
