//! Management API: config read/update, client key CRUD, auth status.
//!
//! Gated by the management key via `Authorization: Bearer` or
//! `X-Management-Key`; loopback peers may bypass when the config allows.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::Router;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;

use modelgate_auth::Conductor;
use modelgate_common::GatewayConfig;

#[derive(Clone)]
pub struct ManagementState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub conductor: Arc<Conductor>,
    pub config_path: Option<PathBuf>,
}

pub fn management_router(state: ManagementState) -> Router {
    Router::new()
        .route("/v0/management/config", get(get_config).put(put_config))
        .route(
            "/v0/management/config.yaml",
            get(get_config).put(put_config),
        )
        .route("/v0/management/auth-status", get(auth_status))
        .route(
            "/v0/management/api-keys",
            get(list_api_keys).put(put_api_keys),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            management_auth_middleware,
        ))
        .with_state(state)
}

async fn management_auth_middleware(
    State(state): State<ManagementState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let config = state.config.load();
    let Some(expected) = config
        .management_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
    else {
        // No key configured: management is loopback-only when permitted.
        if config.allow_localhost_management && peer.ip().is_loopback() {
            return next.run(request).await;
        }
        return StatusCode::NOT_FOUND.into_response();
    };
    if config.allow_localhost_management && peer.ip().is_loopback() {
        return next.run(request).await;
    }
    if presented_management_key(request.headers()) == Some(expected) {
        return next.run(request).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({"error": {"message": "invalid management key", "type": "authentication_error", "code": 401}})),
    )
        .into_response()
}

fn presented_management_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        && let Some(token) = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
    {
        return Some(token.trim());
    }
    headers
        .get("x-management-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

async fn get_config(State(state): State<ManagementState>) -> Response {
    let config = state.config.load_full();
    match serde_yaml::to_string(config.as_ref()) {
        Ok(yaml) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/yaml")],
            yaml,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("serialize config: {err}"),
        )
            .into_response(),
    }
}

async fn put_config(State(state): State<ManagementState>, body: String) -> Response {
    let parsed = match GatewayConfig::from_yaml(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(json!({"error": {"message": err.to_string(), "type": "invalid_request_error", "code": 400}})),
            )
                .into_response();
        }
    };
    state.config.store(Arc::new(parsed));
    if let Some(path) = &state.config_path {
        let tmp = path.with_extension("yaml.tmp");
        let write = async {
            tokio::fs::write(&tmp, body.as_bytes()).await?;
            tokio::fs::rename(&tmp, path).await
        };
        if let Err(err) = write.await {
            tracing::warn!(path = %path.display(), %err, "persist config failed");
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn auth_status(State(state): State<ManagementState>) -> Response {
    let auths = state.conductor.list().await;
    let rows: Vec<serde_json::Value> = auths
        .iter()
        .map(|auth| {
            json!({
                "id": auth.id,
                "provider": auth.provider,
                "label": auth.label,
                "prefix": auth.prefix,
                "status": auth.status,
                "quota": {
                    "exceeded": auth.quota.exceeded,
                    "backoff_level": auth.quota.backoff_level,
                },
                "updated_at": auth.updated_at.to_string(),
            })
        })
        .collect();
    axum::Json(json!({"auths": rows})).into_response()
}

async fn list_api_keys(State(state): State<ManagementState>) -> Response {
    let config = state.config.load();
    axum::Json(json!({"api-keys": config.api_keys})).into_response()
}

async fn put_api_keys(State(state): State<ManagementState>, body: String) -> Response {
    let keys: Vec<String> = match serde_json::from_str(&body) {
        Ok(keys) => keys,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(json!({"error": {"message": format!("expected a JSON string array: {err}"), "type": "invalid_request_error", "code": 400}})),
            )
                .into_response();
        }
    };
    let mut updated = state.config.load_full().as_ref().clone();
    updated.api_keys = keys;
    state.config.store(Arc::new(updated));
    StatusCode::NO_CONTENT.into_response()
}
