//! Reservations — provisional, time-bounded holds of budget capacity.
//!
//! A reservation is a lease: it is created atomically with the scope
//! debits at admission time, and leaves `Active` exactly once — through
//! commit, release, or the expiry sweep.

use crate::scope::{ScopeKind, ScopeRef, period_for};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Committed,
    Released,
}

impl ReservationStatus {
    /// A terminal reservation can never transition again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::Released => "released",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown reservation status: {0:?}")]
pub struct InvalidStatus(pub String);

impl FromStr for ReservationStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "committed" => Ok(Self::Committed),
            "released" => Ok(Self::Released),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

/// A provisional hold created for exactly one request.
///
/// `request_id` is the idempotency key: at most one reservation exists
/// per request, and retried `reserve` calls replay the stored outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub request_id: String,
    pub team_id: String,
    pub key_id: String,
    /// The estimate held against *each* scope in the chain.
    pub reserved_usd: Decimal,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(
        request_id: impl Into<String>,
        team_id: impl Into<String>,
        key_id: impl Into<String>,
        reserved_usd: Decimal,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            team_id: team_id.into(),
            key_id: key_id.into(),
            reserved_usd,
            status: ReservationStatus::Active,
            expires_at,
            created_at: Utc::now(),
        }
    }

    /// The period whose scope rows this hold was placed on. Settlement
    /// after a month rollover must still reverse the original rows.
    pub fn period(&self) -> NaiveDate {
        period_for(self.created_at)
    }

    /// Target scopes in fixed lock order: key scope first, then team.
    pub fn scope_refs(&self) -> [ScopeRef; 2] {
        [
            ScopeRef::new(ScopeKind::Key, self.key_id.clone()),
            ScopeRef::new(ScopeKind::Team, self.team_id.clone()),
        ]
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn new_reservation_is_active() {
        let r = Reservation::new("req-1", "acme", "vk-1", dec!(0.03), Utc::now());
        assert_eq!(r.status, ReservationStatus::Active);
        assert!(!r.id.is_empty());
        assert_ne!(r.id, r.request_id);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ReservationStatus::Active.is_terminal());
        assert!(ReservationStatus::Committed.is_terminal());
        assert!(ReservationStatus::Released.is_terminal());
    }

    #[test]
    fn expiry_only_applies_to_active() {
        let past = Utc::now() - Duration::minutes(5);
        let mut r = Reservation::new("req-1", "acme", "vk-1", dec!(0.03), past);
        assert!(r.is_expired(Utc::now()));

        r.status = ReservationStatus::Released;
        assert!(!r.is_expired(Utc::now()));
    }

    #[test]
    fn scope_refs_in_lock_order() {
        let r = Reservation::new("req-1", "acme", "vk-1", dec!(0.03), Utc::now());
        let [first, second] = r.scope_refs();
        assert_eq!(first.kind, ScopeKind::Key);
        assert_eq!(second.kind, ScopeKind::Team);
    }
}
