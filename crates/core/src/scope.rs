//! Budget scopes — the buckets that limits are enforced against.
//!
//! A scope is identified by (kind, id, period). Periods are calendar
//! months in UTC; rows are created lazily on first reference and never
//! deleted within their period.

use crate::mode::BudgetMode;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which kind of entity a scope budgets.
///
/// The derived `Ord` (Key < Team) is the **fixed global lock order**:
/// every operation that touches both scopes of a chain acquires them in
/// this order, so two calls racing on the same pair cannot deadlock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// A single virtual key.
    Key,
    /// The team owning one or more keys.
    Team,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Team => "team",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown scope kind: {0:?} (expected key or team)")]
pub struct InvalidScopeKind(pub String);

impl FromStr for ScopeKind {
    type Err = InvalidScopeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "key" => Ok(Self::Key),
            "team" => Ok(Self::Team),
            other => Err(InvalidScopeKind(other.to_string())),
        }
    }
}

/// A reference to one scope, independent of period.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeRef {
    pub kind: ScopeKind,
    pub id: String,
}

impl ScopeRef {
    pub fn new(kind: ScopeKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Policy snapshot for one scope in a chain — carries the limits used
/// when the scope row is created lazily.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeSpec {
    pub kind: ScopeKind,
    pub id: String,
    pub limit_usd: Decimal,
    pub overdraft_usd: Decimal,
}

impl ScopeSpec {
    pub fn scope_ref(&self) -> ScopeRef {
        ScopeRef::new(self.kind, self.id.clone())
    }
}

/// The ordered set of scopes that must all authorize a request, plus
/// the effective enforcement mode (most restrictive in the chain).
///
/// Scopes are ordered most-specific first: key scope, then team scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeChain {
    pub team_id: String,
    pub key_id: String,
    pub scopes: Vec<ScopeSpec>,
    pub mode: BudgetMode,
}

/// One budgeting bucket for one entity for one period — the durable
/// ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetScope {
    pub id: String,
    pub kind: ScopeKind,
    pub scope_id: String,
    pub period_start: NaiveDate,
    pub limit_usd: Decimal,
    /// Permanently consumed.
    pub used_usd: Decimal,
    /// Currently held by in-flight reservations.
    pub reserved_usd: Decimal,
    /// Extra allowance beyond the nominal limit.
    pub overdraft_usd: Decimal,
    /// Last time a warn-mode breach was stamped on this scope.
    pub last_alert_at: Option<DateTime<Utc>>,
}

impl BudgetScope {
    pub fn scope_ref(&self) -> ScopeRef {
        ScopeRef::new(self.kind, self.scope_id.clone())
    }

    /// Effective cap: nominal limit plus overdraft allowance.
    pub fn effective_limit(&self) -> Decimal {
        self.limit_usd + self.overdraft_usd
    }

    /// Headroom left before the effective cap. May be negative after a
    /// tolerated commit overshoot.
    pub fn remaining_usd(&self) -> Decimal {
        self.effective_limit() - self.used_usd - self.reserved_usd
    }

    /// The hard-mode admission test: would holding `estimate` more keep
    /// this scope within its effective cap?
    pub fn admits(&self, estimate: Decimal) -> bool {
        self.used_usd + self.reserved_usd + estimate <= self.effective_limit()
    }
}

/// The budgeting period containing `at`: the first day of its UTC month.
pub fn period_for(at: DateTime<Utc>) -> NaiveDate {
    NaiveDate::from_ymd_opt(at.year(), at.month(), 1)
        .expect("first day of a valid month is always a valid date")
}
