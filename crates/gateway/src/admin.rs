//! Operator/diagnostic endpoints under `/v1/admin`.
//!
//! These inspect and exercise the ledger — they are not part of the
//! enforcement contract and never run on the request path.

use crate::{error_body, ApiError, SharedState};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use spendgate_core::{period_for, BudgetScope, ScopeRef};
use spendgate_engine::Reconciler;
use std::sync::Arc;

/// `GET /v1/admin/scopes/{kind}/{id}` — current-period balances for
/// one scope.
pub(crate) async fn scope_handler(
    State(state): State<SharedState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let kind = match kind.parse() {
        Ok(kind) => kind,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_body(
                    "INVALID_SCOPE_TYPE",
                    &format!("unknown scope type {kind:?} (expected key or team)"),
                )),
            )
                .into_response();
        }
    };

    let scope_ref = ScopeRef::new(kind, id);
    match state
        .engine
        .store()
        .fetch_scope(&scope_ref, period_for(Utc::now()))
        .await
    {
        Ok(Some(scope)) => Json(scope_view(&scope)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(error_body(
                "SCOPE_NOT_FOUND",
                &format!("no scope row for {scope_ref} in the current period"),
            )),
        )
            .into_response(),
        Err(e) => ApiError::from(spendgate_core::Error::from(e)).into_response(),
    }
}

fn scope_view(scope: &BudgetScope) -> serde_json::Value {
    json!({
        "scope": scope.scope_ref(),
        "period_start": scope.period_start,
        "limit_usd": scope.limit_usd,
        "used_usd": scope.used_usd,
        "reserved_usd": scope.reserved_usd,
        "overdraft_usd": scope.overdraft_usd,
        "remaining_usd": scope.remaining_usd(),
        "last_alert_at": scope.last_alert_at,
    })
}

#[derive(Deserialize)]
pub(crate) struct InjectHoldRequest {
    request_id: String,
    team_id: String,
    key_id: String,
    amount_usd: Decimal,
    /// Seconds until expiry; negative values create an already-expired
    /// hold, which is what reclaim fault-injection wants.
    #[serde(default)]
    ttl_secs: i64,
}

/// `POST /v1/admin/reservations` — force-create a hold, bypassing
/// enforcement. Fault injection for sweep/reconcile testing.
pub(crate) async fn inject_hold_handler(
    State(state): State<SharedState>,
    Json(req): Json<InjectHoldRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let chain = state.resolver.resolve(&req.team_id, &req.key_id)?;
    let expires_at = Utc::now() + ChronoDuration::seconds(req.ttl_secs);
    let reservation_id = state
        .engine
        .inject_hold(&req.request_id, &chain, req.amount_usd, expires_at)
        .await?;
    Ok(Json(json!({ "reservation_id": reservation_id })))
}

/// `POST /v1/admin/sweep` — run one out-of-cycle reclaim sweep.
pub(crate) async fn sweep_handler(
    State(state): State<SharedState>,
) -> Result<Json<spendgate_engine::SweepStats>, ApiError> {
    let stats = state.sweeper.sweep_once().await?;
    Ok(Json(stats))
}

#[derive(Deserialize)]
pub(crate) struct ReconcileParams {
    #[serde(default)]
    fix: bool,
}

/// `GET /v1/admin/reconcile?fix=true` — audit reserved balances against
/// active reservations, optionally healing drift.
pub(crate) async fn reconcile_handler(
    State(state): State<SharedState>,
    Query(params): Query<ReconcileParams>,
) -> Result<Json<spendgate_engine::ReconcileReport>, ApiError> {
    let reconciler = Reconciler::new(Arc::clone(state.engine.store()));
    let report = reconciler.run(params.fix).await?;
    Ok(Json(report))
}
