//! Settlement data carried from the gateway into `commit`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use spendgate_core::money::round_usd;
use spendgate_core::usage::{TokenCountSource, UsageStatus};
use spendgate_core::{Reservation, UsageEvent};

/// Everything the cost estimator measured about a finished request.
///
/// `actual_usd` is the only required field; the rest default to the
/// values a caller without token-level accounting would send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub actual_usd: Decimal,

    #[serde(default)]
    pub input_tokens: u32,

    #[serde(default)]
    pub output_tokens: u32,

    #[serde(default = "default_pricing_version")]
    pub pricing_version: String,

    #[serde(default)]
    pub token_count_source: TokenCountSource,

    #[serde(default)]
    pub latency_ms: u32,

    #[serde(default)]
    pub status: UsageStatus,
}

fn default_pricing_version() -> String {
    "v1".into()
}

impl Settlement {
    /// A bare settlement carrying only the measured cost.
    pub fn of(actual_usd: Decimal) -> Self {
        Self {
            actual_usd,
            input_tokens: 0,
            output_tokens: 0,
            pricing_version: default_pricing_version(),
            token_count_source: TokenCountSource::Unknown,
            latency_ms: 0,
            status: UsageStatus::Success,
        }
    }

    /// The permanent usage record for the reservation being settled.
    pub(crate) fn into_event(self, reservation: &Reservation) -> UsageEvent {
        let mut event = UsageEvent::new(
            &reservation.request_id,
            &reservation.team_id,
            &reservation.key_id,
            round_usd(self.actual_usd),
        );
        event.input_tokens = self.input_tokens;
        event.output_tokens = self.output_tokens;
        event.pricing_version = self.pricing_version;
        event.token_count_source = self.token_count_source;
        event.latency_ms = self.latency_ms;
        event.status = self.status;
        event
    }
}
