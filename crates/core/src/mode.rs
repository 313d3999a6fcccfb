//! Budget enforcement modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How strictly a scope's budget is enforced.
///
/// The derived `Ord` encodes restrictiveness: `Off < Warn < Hard`.
/// The effective mode of a precedence chain is the `max` over its
/// scopes — the most restrictive configuration wins.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMode {
    /// No check, no ledger entry.
    Off,
    /// Check and record, never block.
    Warn,
    /// Reject when the chain has no headroom.
    #[default]
    Hard,
}

impl BudgetMode {
    /// Whether a failed headroom check rejects the request.
    pub fn enforces(self) -> bool {
        matches!(self, Self::Hard)
    }

    /// Whether the mode creates a reservation at all.
    pub fn observes(self) -> bool {
        !matches!(self, Self::Off)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Warn => "warn",
            Self::Hard => "hard",
        }
    }
}

impl fmt::Display for BudgetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown budget mode: {0:?} (expected off, warn, or hard)")]
pub struct InvalidMode(pub String);

impl FromStr for BudgetMode {
    type Err = InvalidMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "warn" => Ok(Self::Warn),
            "hard" => Ok(Self::Hard),
            other => Err(InvalidMode(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restrictiveness_ordering() {
        assert!(BudgetMode::Off < BudgetMode::Warn);
        assert!(BudgetMode::Warn < BudgetMode::Hard);
        assert_eq!(
            BudgetMode::Warn.max(BudgetMode::Hard),
            BudgetMode::Hard,
            "most restrictive mode wins"
        );
    }

    #[test]
    fn parse_round_trip() {
        for mode in [BudgetMode::Off, BudgetMode::Warn, BudgetMode::Hard] {
            assert_eq!(mode.as_str().parse::<BudgetMode>().unwrap(), mode);
        }
        assert!("advisory".parse::<BudgetMode>().is_err());
    }

    #[test]
    fn only_hard_enforces() {
        assert!(BudgetMode::Hard.enforces());
        assert!(!BudgetMode::Warn.enforces());
        assert!(BudgetMode::Warn.observes());
        assert!(!BudgetMode::Off.observes());
    }
}
