//! Permanent usage records and daily rollups.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Where the settled token counts came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenCountSource {
    ProviderReported,
    Estimated,
    #[default]
    Unknown,
}

impl TokenCountSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProviderReported => "provider_reported",
            Self::Estimated => "estimated",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TokenCountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenCountSource {
    type Err = InvalidUsageField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provider_reported" => Ok(Self::ProviderReported),
            "estimated" => Ok(Self::Estimated),
            "unknown" => Ok(Self::Unknown),
            other => Err(InvalidUsageField(other.to_string())),
        }
    }
}

/// Terminal outcome of the billed request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    #[default]
    Success,
    Denied,
    Error,
}

impl UsageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageStatus {
    type Err = InvalidUsageField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "denied" => Ok(Self::Denied),
            "error" => Ok(Self::Error),
            other => Err(InvalidUsageField(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown usage field value: {0:?}")]
pub struct InvalidUsageField(pub String);

/// Permanent ledger entry for a completed, billed request.
///
/// Unique on `request_id` — creating this row is the only way
/// `used_usd` ever increases, and a duplicate insert means the request
/// was already settled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub request_id: String,
    pub team_id: String,
    pub key_id: String,
    pub cost_usd: Decimal,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub pricing_version: String,
    pub token_count_source: TokenCountSource,
    pub latency_ms: u32,
    pub status: UsageStatus,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        request_id: impl Into<String>,
        team_id: impl Into<String>,
        key_id: impl Into<String>,
        cost_usd: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            team_id: team_id.into(),
            key_id: key_id.into(),
            cost_usd,
            input_tokens: 0,
            output_tokens: 0,
            pricing_version: "v1".into(),
            token_count_source: TokenCountSource::Unknown,
            latency_ms: 0,
            status: UsageStatus::Success,
            timestamp: Utc::now(),
        }
    }

    /// The rollup day this event belongs to (UTC).
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Append/merge aggregate keyed by (day, team, key). Purely derived,
/// rebuildable from usage events; never consulted for enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRollup {
    pub day: NaiveDate,
    pub team_id: String,
    pub key_id: String,
    pub used_usd: Decimal,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub request_count: u64,
}
