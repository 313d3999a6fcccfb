//! The request-path endpoints: reserve, commit, release.
//!
//! Every admission decision — admitted or rejected — carries the
//! `X-Budget-*` headers describing the tightest scope in the chain, so
//! callers can surface remaining budget without a second round trip.

use crate::{error_body, ApiError, SharedState};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use spendgate_core::error::{AdmissionError, Error};
use spendgate_core::money::fmt_usd;
use spendgate_core::BudgetMode;
use spendgate_engine::{Admission, ScopeBalance, Settlement};

pub(crate) const HEADER_MODE: &str = "x-budget-mode";
pub(crate) const HEADER_LIMIT: &str = "x-budget-limit-usd";
pub(crate) const HEADER_USED: &str = "x-budget-used-usd";
pub(crate) const HEADER_REMAINING: &str = "x-budget-remaining-usd";

#[derive(Deserialize)]
pub(crate) struct ReserveRequest {
    request_id: String,
    team_id: String,
    key_id: String,
    estimated_usd: Decimal,
    #[serde(default)]
    streaming: bool,
}

#[derive(Serialize)]
struct ReserveResponse {
    admitted: bool,
    reservation_id: Option<String>,
    mode: BudgetMode,
    scopes: Vec<ScopeBalance>,
}

pub(crate) async fn reserve_handler(
    State(state): State<SharedState>,
    Json(req): Json<ReserveRequest>,
) -> Response {
    let chain = match state.resolver.resolve(&req.team_id, &req.key_id) {
        Ok(chain) => chain,
        Err(e) => return ApiError::from(e).into_response(),
    };

    match state
        .engine
        .reserve(&req.request_id, &chain, req.estimated_usd, req.streaming)
        .await
    {
        Ok(admission) => {
            let headers = admission_headers(&admission);
            let body = ReserveResponse {
                admitted: true,
                reservation_id: admission.reservation_id,
                mode: admission.mode,
                scopes: admission.scopes,
            };
            (StatusCode::OK, headers, Json(body)).into_response()
        }
        Err(Error::Admission(e @ AdmissionError::BudgetExceeded { .. })) => {
            let headers = rejection_headers(chain.mode, &e);
            let body = error_body(e.code(), &e.to_string());
            (StatusCode::PAYMENT_REQUIRED, headers, Json(body)).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[derive(Deserialize)]
pub(crate) struct CommitRequest {
    request_id: String,
    #[serde(flatten)]
    settlement: Settlement,
}

pub(crate) async fn commit_handler(
    State(state): State<SharedState>,
    Json(req): Json<CommitRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.commit(&req.request_id, req.settlement).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub(crate) struct ReleaseRequest {
    request_id: String,
}

pub(crate) async fn release_handler(
    State(state): State<SharedState>,
    Json(req): Json<ReleaseRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.release(&req.request_id).await?;
    Ok(Json(json!({ "ok": true })))
}

// ── Budget headers ────────────────────────────────────────────────────

fn admission_headers(admission: &Admission) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, HEADER_MODE, admission.mode.as_str());
    if let Some(tightest) = admission.tightest() {
        insert_usd(&mut headers, HEADER_LIMIT, tightest.limit_usd);
        insert_usd(&mut headers, HEADER_USED, tightest.used_usd);
        insert_usd(&mut headers, HEADER_REMAINING, tightest.remaining_usd);
    }
    headers
}

fn rejection_headers(mode: BudgetMode, rejection: &AdmissionError) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, HEADER_MODE, mode.as_str());
    if let AdmissionError::BudgetExceeded {
        used,
        remaining,
        limit,
        ..
    } = rejection
    {
        insert_usd(&mut headers, HEADER_LIMIT, *limit);
        insert_usd(&mut headers, HEADER_USED, *used);
        insert_usd(&mut headers, HEADER_REMAINING, *remaining);
    }
    headers
}

fn insert_usd(headers: &mut HeaderMap, name: &'static str, amount: Decimal) {
    insert_header(headers, name, &fmt_usd(amount));
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_router, test_router_with};
    use axum::body::Body;
    use axum::http::Request;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn reserve_admits_and_reports_headroom() {
        let (app, _state) = test_router().await;

        let response = app
            .oneshot(post_json(
                "/v1/admission/reserve",
                json!({
                    "request_id": "req-1",
                    "team_id": "acme",
                    "key_id": "vk-1",
                    "estimated_usd": "0.03"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(HEADER_MODE).unwrap(),
            "hard"
        );
        // Team scope ($0.05) is tighter than the key scope ($5)
        assert_eq!(
            response.headers().get(HEADER_REMAINING).unwrap(),
            "0.02"
        );

        let body = body_json(response).await;
        assert_eq!(body["admitted"], true);
        assert!(body["reservation_id"].is_string());
        assert_eq!(body["scopes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reserve_rejection_is_402_with_code_and_headers() {
        let (app, _state) = test_router().await;

        let response = app
            .oneshot(post_json(
                "/v1/admission/reserve",
                json!({
                    "request_id": "req-1",
                    "team_id": "acme",
                    "key_id": "vk-1",
                    "estimated_usd": "0.10"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            response.headers().get(HEADER_REMAINING).unwrap(),
            "0.05"
        );
        assert_eq!(response.headers().get(HEADER_USED).unwrap(), "0");
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "BUDGET_EXCEEDED");
    }

    #[tokio::test]
    async fn negative_estimate_is_400() {
        let (app, _state) = test_router().await;

        let response = app
            .oneshot(post_json(
                "/v1/admission/reserve",
                json!({
                    "request_id": "req-1",
                    "team_id": "acme",
                    "key_id": "vk-1",
                    "estimated_usd": "-0.01"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "INVALID_AMOUNT");
    }

    #[tokio::test]
    async fn unknown_key_is_422() {
        let (app, _state) = test_router().await;

        let response = app
            .oneshot(post_json(
                "/v1/admission/reserve",
                json!({
                    "request_id": "req-1",
                    "team_id": "acme",
                    "key_id": "vk-ghost",
                    "estimated_usd": "0.01"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "SCOPE_RESOLUTION_ERROR");
    }

    #[tokio::test]
    async fn commit_unknown_request_is_404() {
        let (app, _state) = test_router().await;

        let response = app
            .oneshot(post_json(
                "/v1/admission/commit",
                json!({ "request_id": "ghost", "actual_usd": "0.01" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "RESERVATION_NOT_FOUND");
    }

    #[tokio::test]
    async fn full_cycle_settles_usage() {
        let (app, state) = test_router().await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/admission/reserve",
                json!({
                    "request_id": "req-1",
                    "team_id": "acme",
                    "key_id": "vk-1",
                    "estimated_usd": "0.03"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json(
                "/v1/admission/commit",
                json!({
                    "request_id": "req-1",
                    "actual_usd": "0.02",
                    "input_tokens": 120,
                    "output_tokens": 40,
                    "token_count_source": "provider_reported"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let event = state
            .engine
            .store()
            .usage_event("req-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.cost_usd, dec!(0.02));
        assert_eq!(event.input_tokens, 120);
    }

    #[tokio::test]
    async fn release_is_ok_and_repeatable() {
        let (app, _state) = test_router().await;

        app.clone()
            .oneshot(post_json(
                "/v1/admission/reserve",
                json!({
                    "request_id": "req-1",
                    "team_id": "acme",
                    "key_id": "vk-1",
                    "estimated_usd": "0.03"
                }),
            ))
            .await
            .unwrap();

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(post_json(
                    "/v1/admission/release",
                    json!({ "request_id": "req-1" }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn warn_mode_admits_past_limit() {
        use spendgate_core::BudgetMode;
        let (app, _state) = test_router_with(dec!(0.01), dec!(0.01), BudgetMode::Warn).await;

        let response = app
            .oneshot(post_json(
                "/v1/admission/reserve",
                json!({
                    "request_id": "req-1",
                    "team_id": "acme",
                    "key_id": "vk-1",
                    "estimated_usd": "0.05"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(HEADER_MODE).unwrap(), "warn");
        let body = body_json(response).await;
        assert_eq!(body["admitted"], true);
    }
}
