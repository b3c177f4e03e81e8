use crate::auth::rate_limit::rate_limit_middleware;
use crate::auth::AuthUser;
use crate::error::AppError;
use crate::models::agent::{self, ActivateRequest, RequestActivationRequest};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Only the unauthenticated endpoints sit behind the IP limiter.
    let unauthenticated = Router::new()
        .route("/request-activation", post(request_activation))
        .route("/resolve", get(resolve_code))
        .layer(axum::middleware::from_fn_with_state(
            state,
            rate_limit_middleware,
        ));

    Router::new()
        .route("/activate", post(activate))
        .merge(unauthenticated)
}

async fn request_activation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RequestActivationRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if body.device_id.is_empty() || body.hostname.is_empty() || body.os.is_empty() {
        return Err(AppError::BadRequest(
            "device_id, hostname and os are required".into(),
        ));
    }

    let db = state.db.clone();
    let (agent, created) = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        match agent::find_by_device_id(&conn, &body.device_id)? {
            // An activated device is returned verbatim so a replayed request
            // can never hijack it.
            Some(a) if a.is_activated() => Ok::<_, AppError>((a, false)),
            Some(a) => Ok((agent::refresh_pending(&conn, &a, &body)?, false)),
            None => {
                if let Some(code) = body.activation_code.as_deref().filter(|c| !c.is_empty()) {
                    if let Some(by_code) = agent::find_by_code(&conn, code)? {
                        if by_code.is_activated() {
                            return Err(AppError::Conflict(
                                "Activation code has already been used".into(),
                            ));
                        }
                        return Ok((agent::adopt_device(&conn, &by_code, &body)?, false));
                    }
                }
                Ok((agent::create_pending(&conn, &body)?, true))
            }
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    let activated = agent.is_activated();
    Ok((
        status,
        Json(json!({
            "activation_code": agent.activation_code,
            "agent": agent,
            "activated": activated,
        })),
    ))
}

#[derive(Deserialize)]
pub struct ResolveQuery {
    pub code: Option<String>,
    pub device_id: Option<String>,
    pub hardware_id: Option<String>,
}

async fn resolve_code(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest("code is required".into()))?;

    let db = state.db.clone();
    let agent = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        agent::find_by_code(&conn, &code)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??
    .ok_or_else(|| AppError::NotFound("Unknown activation code".into()))?;

    // A code shown on one device must not resolve from another.
    if let Some(device_id) = &query.device_id {
        if agent.device_id != *device_id {
            return Err(AppError::Conflict(
                "Activation code is bound to a different device".into(),
            ));
        }
    }
    let stored_hw = agent.hardware_id();
    if let (Some(claimed), Some(stored)) = (&query.hardware_id, &stored_hw) {
        if claimed != stored {
            return Err(AppError::Conflict(
                "Hardware fingerprint does not match this activation code".into(),
            ));
        }
    }

    let activated = agent.is_activated();
    let parsed_status = agent.parsed_status();
    Ok(Json(json!({
        "agent": agent,
        "activated": activated,
        "hardware_id": stored_hw,
        "parsed_status": parsed_status,
    })))
}

async fn activate(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(body): Json<ActivateRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.activation_code.is_empty() {
        return Err(AppError::BadRequest("activation_code is required".into()));
    }

    let db = state.db.clone();
    let agent = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let agent = agent::find_by_code(&conn, &body.activation_code)?
            .ok_or_else(|| AppError::NotFound("Unknown activation code".into()))?;
        match &agent.user_id {
            // One-time-use across users, idempotent for the same one.
            Some(owner) if *owner != user.user_id => Err(AppError::Conflict(
                "Activation code has already been used by another account".into(),
            )),
            _ => Ok(agent::activate(
                &conn,
                &agent,
                &user.user_id,
                body.name.as_deref(),
            )?),
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    Ok(Json(json!({ "agent": agent })))
}
