//! The reservation engine — the transactional heart of admission.
//!
//! Every read-modify-write of a scope's balances happens under that
//! scope's async mutex, and when an operation spans both scopes of a
//! chain the locks are taken in the fixed global order (key before
//! team, then lexicographic) so two racing calls can never deadlock.
//! The store layer additionally applies each compound operation in a
//! single transaction; write conflicts surface as retryable errors and
//! are absorbed here with bounded backoff.

use crate::settlement::Settlement;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use spendgate_core::error::{AdmissionError, Error, LedgerError, Result};
use spendgate_core::money::round_usd;
use spendgate_core::store::{HoldOutcome, LedgerStore, ReleaseOutcome, SettleOutcome};
use spendgate_core::{
    BudgetMode, BudgetScope, Reservation, ReservationStatus, ScopeChain, ScopeRef, period_for,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

const MAX_CONFLICT_RETRIES: u32 = 3;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(10);

/// Minimum gap between two `last_alert_at` stamps on the same scope.
fn alert_interval() -> ChronoDuration {
    ChronoDuration::hours(1)
}

/// Point-in-time balances for one scope, as returned with every
/// admission decision.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeBalance {
    pub scope: ScopeRef,
    pub limit_usd: Decimal,
    pub used_usd: Decimal,
    pub reserved_usd: Decimal,
    pub remaining_usd: Decimal,
}

impl From<&BudgetScope> for ScopeBalance {
    fn from(scope: &BudgetScope) -> Self {
        Self {
            scope: scope.scope_ref(),
            limit_usd: scope.effective_limit(),
            used_usd: scope.used_usd,
            reserved_usd: scope.reserved_usd,
            remaining_usd: scope.remaining_usd(),
        }
    }
}

/// A granted admission: the hold (if any) plus the balances the caller
/// may surface as informational headers.
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    /// `None` when mode = off — nothing was written.
    pub reservation_id: Option<String>,
    pub mode: BudgetMode,
    pub scopes: Vec<ScopeBalance>,
}

impl Admission {
    /// The scope with the least headroom — the one worth telling the
    /// caller about.
    pub fn tightest(&self) -> Option<&ScopeBalance> {
        self.scopes.iter().min_by_key(|s| s.remaining_usd)
    }
}

/// Registry of per-scope async mutexes, created on first use.
#[derive(Default)]
struct ScopeLocks {
    registry: StdMutex<HashMap<ScopeRef, Arc<AsyncMutex<()>>>>,
}

impl ScopeLocks {
    /// Lock every scope in the set, always in sorted (global) order.
    async fn lock_all(&self, mut refs: Vec<ScopeRef>) -> Vec<OwnedMutexGuard<()>> {
        refs.sort();
        refs.dedup();

        let handles: Vec<Arc<AsyncMutex<()>>> = {
            let mut registry = self
                .registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            refs.into_iter()
                .map(|r| Arc::clone(registry.entry(r).or_default()))
                .collect()
        };

        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        guards
    }
}

async fn retry_conflicts<T, F, Fut>(op: &'static str, mut call: F) -> std::result::Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, LedgerError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Err(e) if e.is_retryable() && attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                debug!(op, attempt, "Write conflict, backing off");
                tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
            }
            other => return other,
        }
    }
}

/// Places, settles, and releases budget holds.
///
/// The engine is the only component that mutates scope balances, and
/// every mutation goes through [`LedgerStore`]'s atomic operations.
pub struct ReservationEngine {
    store: Arc<dyn LedgerStore>,
    locks: ScopeLocks,
    ttl: ChronoDuration,
}

impl ReservationEngine {
    pub fn new(store: Arc<dyn LedgerStore>, ttl: Duration) -> Self {
        Self {
            store,
            locks: ScopeLocks::default(),
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(900)),
        }
    }

    /// The underlying store, for diagnostic reads (scope inspection,
    /// reconciliation). Never used to write around the engine.
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Admit a request by placing a hold of `estimated_usd` across
    /// every scope in the chain, or reject it with `BUDGET_EXCEEDED`.
    ///
    /// - mode = off: admitted immediately, no ledger entry.
    /// - mode = warn, or `streaming`: the headroom check runs but never
    ///   blocks; the hold is still placed so the ledger stays accurate.
    /// - mode = hard: any scope without headroom rejects the call and
    ///   no scope is modified.
    ///
    /// Idempotent on `request_id`: a retry replays the stored hold
    /// instead of double-reserving.
    pub async fn reserve(
        &self,
        request_id: &str,
        chain: &ScopeChain,
        estimated_usd: Decimal,
        streaming: bool,
    ) -> Result<Admission> {
        if estimated_usd < Decimal::ZERO {
            return Err(AdmissionError::InvalidAmount(estimated_usd).into());
        }
        if !chain.mode.observes() {
            debug!(request_id, "Budget mode off, admitting without a hold");
            return Ok(Admission {
                reservation_id: None,
                mode: chain.mode,
                scopes: vec![],
            });
        }

        if let Some(existing) = self.store.find_reservation(request_id).await? {
            debug!(request_id, reservation_id = %existing.id, "Replaying existing reservation");
            return self.replay(&existing, chain.mode).await;
        }

        let estimate = round_usd(estimated_usd);
        // Streaming responses cannot be pre-charged before token
        // generation completes; they are admitted like warn mode and
        // settled in full at commit.
        let enforce = chain.mode.enforces() && !streaming;

        let refs: Vec<ScopeRef> = chain.scopes.iter().map(|s| s.scope_ref()).collect();
        let _guards = self.locks.lock_all(refs).await;

        let now = Utc::now();
        let period = period_for(now);
        let reservation = Reservation::new(
            request_id,
            &chain.team_id,
            &chain.key_id,
            estimate,
            now + self.ttl,
        );

        let outcome = retry_conflicts("place_hold", || {
            self.store
                .place_hold(&reservation, &chain.scopes, period, enforce)
        })
        .await;

        match outcome {
            Ok(HoldOutcome::Held { scopes, breaches }) => {
                for breach in &breaches {
                    self.signal_breach(breach, &scopes, estimate, now).await;
                }
                info!(
                    request_id,
                    reservation_id = %reservation.id,
                    estimate = %estimate,
                    mode = %chain.mode,
                    "Reservation placed"
                );
                Ok(Admission {
                    reservation_id: Some(reservation.id),
                    mode: chain.mode,
                    scopes: scopes.iter().map(ScopeBalance::from).collect(),
                })
            }
            Ok(HoldOutcome::Rejected {
                scope,
                used,
                remaining,
                limit,
            }) => {
                info!(request_id, scope = %scope, estimate = %estimate, "Admission rejected");
                Err(AdmissionError::BudgetExceeded {
                    scope: scope.to_string(),
                    requested: estimate,
                    used,
                    remaining,
                    limit,
                }
                .into())
            }
            Err(e) if e.is_retryable() => {
                // Lost a race on request_id: the winning call's hold is
                // the outcome to replay.
                match self.store.find_reservation(request_id).await? {
                    Some(existing) => self.replay(&existing, chain.mode).await,
                    None => Err(Error::Ledger(e)),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Settle a reservation at the actual measured cost.
    ///
    /// Reverses the hold using the original estimate and charges
    /// `settlement.actual_usd` to `used_usd` — overshoot beyond the
    /// nominal limit is tolerated because the hold already secured
    /// admission. A retry with the same cost is a no-op; any other
    /// duplicate settlement fails with `RESERVATION_NOT_FOUND`.
    pub async fn commit(&self, request_id: &str, settlement: Settlement) -> Result<()> {
        if settlement.actual_usd < Decimal::ZERO {
            return Err(AdmissionError::InvalidAmount(settlement.actual_usd).into());
        }
        let Some(reservation) = self.store.find_reservation(request_id).await? else {
            return Err(AdmissionError::ReservationNotFound(request_id.into()).into());
        };

        let actual = round_usd(settlement.actual_usd);
        if reservation.status.is_terminal() {
            return self
                .check_duplicate_commit(request_id, reservation.status, actual)
                .await;
        }

        let _guards = self.locks.lock_all(reservation.scope_refs().to_vec()).await;

        let event = settlement.into_event(&reservation);
        let outcome =
            retry_conflicts("settle_hold", || self.store.settle_hold(request_id, &event)).await?;

        match outcome {
            SettleOutcome::Settled { .. } => {
                info!(
                    request_id,
                    estimate = %reservation.reserved_usd,
                    actual = %actual,
                    "Reservation committed"
                );
                Ok(())
            }
            SettleOutcome::AlreadyTerminal { status } => {
                self.check_duplicate_commit(request_id, status, actual).await
            }
            SettleOutcome::NotFound => {
                Err(AdmissionError::ReservationNotFound(request_id.into()).into())
            }
        }
    }

    /// Cancel a reservation without recording usage.
    ///
    /// Safe to call repeatedly: a terminal reservation is a no-op.
    pub async fn release(&self, request_id: &str) -> Result<()> {
        let Some(reservation) = self.store.find_reservation(request_id).await? else {
            return Err(AdmissionError::ReservationNotFound(request_id.into()).into());
        };
        if reservation.status.is_terminal() {
            debug!(request_id, status = %reservation.status, "Release on terminal reservation, no-op");
            return Ok(());
        }

        let _guards = self.locks.lock_all(reservation.scope_refs().to_vec()).await;

        let outcome =
            retry_conflicts("release_hold", || self.store.release_hold(request_id)).await?;

        match outcome {
            ReleaseOutcome::Released { amount } => {
                info!(request_id, returned = %amount, "Reservation released");
                Ok(())
            }
            // Commit or the sweep got there first
            ReleaseOutcome::AlreadyTerminal { .. } | ReleaseOutcome::NotFound => Ok(()),
        }
    }

    /// Reverse one expired hold. Returns the amount reclaimed, or zero
    /// when a live commit/release won the race.
    pub(crate) async fn reclaim(&self, reservation: &Reservation) -> Result<Decimal> {
        let _guards = self.locks.lock_all(reservation.scope_refs().to_vec()).await;

        let outcome = retry_conflicts("reclaim_hold", || {
            self.store.release_hold(&reservation.request_id)
        })
        .await?;

        match outcome {
            ReleaseOutcome::Released { amount } => {
                info!(
                    request_id = %reservation.request_id,
                    returned = %amount,
                    expired_at = %reservation.expires_at,
                    "Expired reservation reclaimed"
                );
                Ok(amount)
            }
            ReleaseOutcome::AlreadyTerminal { .. } | ReleaseOutcome::NotFound => Ok(Decimal::ZERO),
        }
    }

    pub(crate) async fn expired_holds(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Reservation>> {
        Ok(self.store.expired_holds(now, limit).await?)
    }

    /// Place an unenforced hold with an explicit expiry. Diagnostic
    /// surface for fault-injection tests; never on the request path.
    pub async fn inject_hold(
        &self,
        request_id: &str,
        chain: &ScopeChain,
        amount: Decimal,
        expires_at: DateTime<Utc>,
    ) -> Result<String> {
        if amount < Decimal::ZERO {
            return Err(AdmissionError::InvalidAmount(amount).into());
        }
        let refs: Vec<ScopeRef> = chain.scopes.iter().map(|s| s.scope_ref()).collect();
        let _guards = self.locks.lock_all(refs).await;

        let reservation = Reservation::new(
            request_id,
            &chain.team_id,
            &chain.key_id,
            round_usd(amount),
            expires_at,
        );

        let outcome = retry_conflicts("inject_hold", || {
            self.store
                .place_hold(&reservation, &chain.scopes, period_for(Utc::now()), false)
        })
        .await?;

        match outcome {
            HoldOutcome::Held { .. } => {
                warn!(request_id, amount = %reservation.reserved_usd, "Hold injected out of band");
                Ok(reservation.id)
            }
            HoldOutcome::Rejected { .. } => Err(Error::Internal(
                "unenforced hold placement cannot reject".into(),
            )),
        }
    }

    /// Decide whether a commit against a terminal reservation is an
    /// idempotent retry (same cost already recorded) or a genuine
    /// duplicate-settlement fault.
    async fn check_duplicate_commit(
        &self,
        request_id: &str,
        status: ReservationStatus,
        actual: Decimal,
    ) -> Result<()> {
        if status == ReservationStatus::Committed
            && let Some(event) = self.store.usage_event(request_id).await?
        {
            if event.cost_usd == actual {
                debug!(request_id, "Commit retry matches recorded usage, no-op");
                return Ok(());
            }
            return Err(AdmissionError::ReservationNotFound(format!(
                "request {request_id} already committed at ${}",
                event.cost_usd
            ))
            .into());
        }
        Err(AdmissionError::ReservationNotFound(format!(
            "request {request_id} is already {status}"
        ))
        .into())
    }

    async fn replay(&self, existing: &Reservation, mode: BudgetMode) -> Result<Admission> {
        let period = existing.period();
        let mut scopes = Vec::with_capacity(2);
        for scope_ref in existing.scope_refs() {
            if let Some(scope) = self.store.fetch_scope(&scope_ref, period).await? {
                scopes.push(ScopeBalance::from(&scope));
            }
        }
        Ok(Admission {
            reservation_id: Some(existing.id.clone()),
            mode,
            scopes,
        })
    }

    /// A warn-mode (or streaming) hold went through on a scope without
    /// headroom: log it and stamp `last_alert_at`, at most once per
    /// hour per scope. Alert delivery is an external collaborator.
    async fn signal_breach(
        &self,
        breach: &ScopeRef,
        scopes: &[BudgetScope],
        estimate: Decimal,
        now: DateTime<Utc>,
    ) {
        warn!(scope = %breach, requested = %estimate, "Budget exceeded without enforcement");

        let Some(row) = scopes.iter().find(|s| &s.scope_ref() == breach) else {
            return;
        };
        let due = row.last_alert_at.is_none_or(|last| now - last >= alert_interval());
        if !due {
            return;
        }
        if let Err(e) = self.store.stamp_alert(breach, row.period_start, now).await {
            warn!(scope = %breach, error = %e, "Failed to stamp breach alert");
        }
    }
}
