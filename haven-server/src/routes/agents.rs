use crate::auth::AuthUser;
use crate::error::AppError;
use crate::models::agent::{self, RegisterAgentRequest};
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_agents))
        .route("/register", post(register_agent))
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let agents = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        agent::find_all_for_user(&conn, &user.user_id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(json!({ "agents": agents })))
}

async fn register_agent(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(body): Json<RegisterAgentRequest>,
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
            Some(a) if a.user_id.as_deref().is_some_and(|u| u != user.user_id) => Err(
                AppError::Forbidden("Device is registered to another account".into()),
            ),
            Some(a) => Ok((agent::register_heartbeat(&conn, &a, &user.user_id, &body)?, false)),
            None => Ok((agent::insert_registered(&conn, &user.user_id, &body)?, true)),
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(json!({ "agent": agent, "created": created }))))
}
