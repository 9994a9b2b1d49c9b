//! HTTP request handlers.

use std::time::Duration;

use axum::{
    extract::{Extension, Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::server::{AppState, RequestId};
use super::types::{PreviewRequest, PreviewResponse, ResetQuery, RouteRequest, RouteResponse};
use crate::config::Config;
use crate::error::Error;
use crate::router::{http_providers, CircuitState, ProviderDescriptor, RouteSuccess};
use crate::task::TaskRequest;

/// Response header: correlation ID (UUID v4).
pub const AIROUTE_REQUEST_ID_HEADER: &str = "x-airoute-request-id";
/// Response header: provider that produced the result.
pub const AIROUTE_PROVIDER_HEADER: &str = "x-airoute-provider";
/// Response header: attributed cost (decimal, e.g. "5.0000").
pub const AIROUTE_COST_HEADER: &str = "x-airoute-cost";
/// Response header: winning attempt latency in milliseconds (integer).
pub const AIROUTE_LATENCY_MS_HEADER: &str = "x-airoute-latency-ms";

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }
}

/// Attach routing metadata headers. Provider, cost and latency only on success.
fn attach_airoute_headers(response: &mut Response, request_id: &str, success: Option<&RouteSuccess>) {
    insert_header(response, AIROUTE_REQUEST_ID_HEADER, request_id);

    if let Some(success) = success {
        insert_header(response, AIROUTE_PROVIDER_HEADER, &success.provider_id);
        insert_header(response, AIROUTE_COST_HEADER, &format!("{:.4}", success.cost));
        response.headers_mut().insert(
            HeaderName::from_static(AIROUTE_LATENCY_MS_HEADER),
            HeaderValue::from(success.latency.as_millis() as u64),
        );
    }
}

/// Handle POST /v1/route
pub async fn route(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<RouteRequest>,
) -> Response {
    let correlation_id = request_id.0.to_string();
    let deadline = body
        .deadline_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.router.default_deadline());

    tracing::info!(
        request_id = %correlation_id,
        kind = %body.kind,
        deadline_ms = deadline.as_millis() as u64,
        "Received route request"
    );

    let payload = match serde_json::to_vec(&body.payload) {
        Ok(payload) => payload,
        Err(e) => {
            let mut response = Error::BadRequest(e.to_string()).into_response();
            attach_airoute_headers(&mut response, &correlation_id, None);
            return response;
        }
    };

    let request = TaskRequest::new(body.kind, payload, deadline).with_constraints(body.constraints);

    match state.router.route(request).await {
        Ok(success) => {
            let mut response = Json(RouteResponse::from(success.clone())).into_response();
            attach_airoute_headers(&mut response, &correlation_id, Some(&success));
            response
        }
        Err(err) => {
            let mut response = Error::from(err).into_response();
            attach_airoute_headers(&mut response, &correlation_id, None);
            response
        }
    }
}

/// Handle POST /v1/route/preview - ranking without calling any provider
pub async fn preview(
    State(state): State<AppState>,
    Json(body): Json<PreviewRequest>,
) -> Result<Json<PreviewResponse>, Error> {
    let candidates = state.router.preview(body.kind, &body.constraints)?;
    Ok(Json(PreviewResponse {
        kind: body.kind,
        candidates,
    }))
}

/// Handle GET /v1/status - full observability snapshot
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.router.snapshot())
}

/// Handle GET /health
///
/// `ok` when every circuit is closed, `unhealthy` (503) when every circuit is
/// open, `degraded` otherwise.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshots = state.router.health().all_snapshots();

    let mut providers = serde_json::Map::new();
    for snap in &snapshots {
        providers.insert(
            snap.id.clone(),
            serde_json::json!({
                "state": snap.state.as_str(),
                "failure_count": snap.consecutive_failures,
            }),
        );
    }

    let open = snapshots
        .iter()
        .filter(|s| s.state == CircuitState::Open)
        .count();
    let closed = snapshots
        .iter()
        .filter(|s| s.state == CircuitState::Closed)
        .count();

    let (status, code) = if !snapshots.is_empty() && open == snapshots.len() {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    } else if closed == snapshots.len() {
        ("ok", StatusCode::OK)
    } else {
        ("degraded", StatusCode::OK)
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "service": "airoute",
            "providers": providers,
        })),
    )
}

/// Handle GET /providers
pub async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    let providers: Vec<ProviderDescriptor> = state
        .router
        .registry()
        .descriptors()
        .iter()
        .map(|d| d.as_ref().clone())
        .collect();

    Json(serde_json::json!({
        "providers": providers
    }))
}

/// Handle POST /admin/reset[?provider=<id>]
pub async fn admin_reset(
    State(state): State<AppState>,
    Query(query): Query<ResetQuery>,
) -> Result<Json<serde_json::Value>, Error> {
    let target = query.provider.as_deref();
    if !state.router.reset(target) {
        return Err(Error::NotFound(format!(
            "provider '{}'",
            target.unwrap_or_default()
        )));
    }
    Ok(Json(serde_json::json!({
        "reset": target.unwrap_or("all"),
    })))
}

/// Handle POST /admin/reload - re-read the config file and swap providers
pub async fn admin_reload(State(state): State<AppState>) -> Result<Json<serde_json::Value>, Error> {
    let path = state
        .config_path
        .as_ref()
        .ok_or_else(|| Error::BadRequest("server was started without a config file".to_string()))?;

    let (config, _) = Config::from_file_with_env(path.as_path())?;
    state
        .router
        .reload(http_providers(&config, &state.http_client));

    tracing::info!(
        path = %path.display(),
        "reloaded providers; health and routing settings keep their startup values"
    );

    Ok(Json(serde_json::json!({
        "providers": state.router.registry().ids(),
    })))
}
