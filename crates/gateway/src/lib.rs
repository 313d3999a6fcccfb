//! HTTP admission surface for spendgate.
//!
//! Exposes the request-path operations (reserve, commit, release) and
//! the operator/diagnostic endpoints under `/v1/admin`. Budget headers
//! (`X-Budget-*`) accompany every admission decision.
//!
//! Built on Axum for high performance async HTTP.

pub mod admin;
pub mod admission;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use spendgate_config::AppConfig;
use spendgate_core::error::{AdmissionError, Error};
use spendgate_core::store::LedgerStore;
use spendgate_engine::{ExpirySweeper, PrecedenceResolver, ReservationEngine};
use spendgate_ledger::SqliteLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub resolver: PrecedenceResolver,
    pub engine: Arc<ReservationEngine>,
    pub sweeper: Arc<ExpirySweeper>,
    pub start_time: DateTime<Utc>,
}

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/admission/reserve", post(admission::reserve_handler))
        .route("/v1/admission/commit", post(admission::commit_handler))
        .route("/v1/admission/release", post(admission::release_handler))
        .route("/v1/admin/scopes/{kind}/{id}", get(admin::scope_handler))
        .route("/v1/admin/reservations", post(admin::inject_hold_handler))
        .route("/v1/admin/sweep", post(admin::sweep_handler))
        .route("/v1/admin/reconcile", get(admin::reconcile_handler))
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server, with the expiry sweeper running
/// alongside it and stopping on the same ctrl-c.
pub async fn start(config: AppConfig) -> spendgate_core::Result<()> {
    let store: Arc<dyn LedgerStore> = Arc::new(SqliteLedger::new(&config.database.path).await?);
    let engine = Arc::new(ReservationEngine::new(
        Arc::clone(&store),
        Duration::from_secs(config.reservations.ttl_secs),
    ));
    let resolver = PrecedenceResolver::new(&config);
    let sweeper = Arc::new(ExpirySweeper::new(
        Arc::clone(&engine),
        Duration::from_secs(config.reservations.sweep_interval_secs),
        config.reservations.sweep_batch,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_task = tokio::spawn({
        let sweeper = Arc::clone(&sweeper);
        async move { sweeper.run(shutdown_rx).await }
    });

    let state = Arc::new(GatewayState {
        resolver,
        engine,
        sweeper,
        start_time: Utc::now(),
    });
    let app = build_router(state);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {addr}: {e}")))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .map_err(|e| Error::Internal(format!("Server error: {e}")))?;

    let _ = shutdown_tx.send(true);
    let _ = sweep_task.await;
    Ok(())
}

// ── Error mapping ─────────────────────────────────────────────────────

/// Wire-level error wrapper: every failure becomes a JSON body with a
/// machine-readable `code` and the status the taxonomy prescribes.
pub(crate) struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        Self(Error::Admission(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self.0 {
            Error::Admission(e) => {
                let status = match e {
                    AdmissionError::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
                    AdmissionError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
                    AdmissionError::ScopeResolution(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    AdmissionError::ReservationNotFound(_) => StatusCode::NOT_FOUND,
                };
                (status, e.code(), e.to_string())
            }
            other => {
                error!(error = %other, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    other.to_string(),
                )
            }
        };
        (status, Json(error_body(code, &message))).into_response()
    }
}

pub(crate) fn error_body(code: &str, message: &str) -> serde_json::Value {
    json!({ "error": { "code": code, "message": message } })
}

// ── Handlers ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
}

async fn health_handler(
    axum::extract::State(state): axum::extract::State<SharedState>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (Utc::now() - state.start_time).num_seconds(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use spendgate_config::{KeyPolicy, TeamPolicy};
    use spendgate_core::BudgetMode;

    /// A router over an in-memory ledger with one team ("acme",
    /// $0.05 hard) owning one key ("vk-1", $5.00 hard).
    pub(crate) async fn test_router() -> (Router, SharedState) {
        test_router_with(dec!(5), dec!(0.05), BudgetMode::Hard).await
    }

    pub(crate) async fn test_router_with(
        key_limit: Decimal,
        team_limit: Decimal,
        mode: BudgetMode,
    ) -> (Router, SharedState) {
        let mut config = AppConfig::default();
        config.teams.push(TeamPolicy {
            id: "acme".into(),
            limit_usd: team_limit,
            overdraft_usd: Decimal::ZERO,
            mode,
        });
        config.keys.push(KeyPolicy {
            id: "vk-1".into(),
            team: "acme".into(),
            limit_usd: key_limit,
            overdraft_usd: Decimal::ZERO,
            mode,
        });

        let store: Arc<dyn LedgerStore> =
            Arc::new(SqliteLedger::new("sqlite::memory:").await.unwrap());
        let engine = Arc::new(ReservationEngine::new(
            Arc::clone(&store),
            Duration::from_secs(900),
        ));
        let sweeper = Arc::new(ExpirySweeper::new(
            Arc::clone(&engine),
            Duration::from_secs(60),
            100,
        ));
        let state = Arc::new(GatewayState {
            resolver: PrecedenceResolver::new(&config),
            engine,
            sweeper,
            start_time: Utc::now(),
        });
        (build_router(Arc::clone(&state)), state)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint() {
        let (app, _state) = test_router().await;
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
