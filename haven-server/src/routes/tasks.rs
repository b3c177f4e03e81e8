use crate::auth::AuthUser;
use crate::error::AppError;
use crate::models::payload::{self, BackupIntent, BackupMode, TaskType};
use crate::models::{agent, job, task};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_tasks).post(create_task))
        .route("/claim", post(claim_task))
        .route("/{id}/complete", post(complete_task))
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub agent_id: Option<String>,
    pub device_id: Option<String>,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(body): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let task_type = TaskType::parse(&body.task_type)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid task type: {:?}", body.task_type)))?;

    let mut payload = match body.payload {
        Value::Null => json!({}),
        v @ Value::Object(_) => v,
        _ => return Err(AppError::BadRequest("payload must be an object".into())),
    };

    let db = state.db.clone();
    let task = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let agent = match (&body.agent_id, &body.device_id) {
            (Some(id), _) => agent::find_by_id_for_user(&conn, id, &user.user_id)?,
            (None, Some(device)) => agent::find_by_device_for_user(&conn, device, &user.user_id)?,
            (None, None) => {
                return Err(AppError::BadRequest("agent_id or device_id is required".into()))
            }
        }
        .ok_or_else(|| AppError::NotFound("Agent not found".into()))?;

        if task_type == TaskType::Backup {
            match payload::classify_backup_payload(&payload).map_err(AppError::BadRequest)? {
                BackupIntent::Fixed(mode) => payload::set_mode(&mut payload, mode),
                BackupIntent::Auto { src_path } => {
                    // Auto is committed to a concrete mode before the task
                    // becomes visible; it never reaches the agent.
                    let resolved = match src_path.as_deref() {
                        Some(root) => payload::resolve_auto_mode(
                            job::latest_completed_full(&conn, &user.user_id, &agent.device_id, root)?
                                .is_some(),
                        ),
                        None => BackupMode::Full,
                    };
                    payload::set_mode(&mut payload, resolved);
                }
                BackupIntent::Unspecified => {}
            }
        }

        Ok(task::create(&conn, &user.user_id, &agent, task_type, &payload)?)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    Ok((StatusCode::CREATED, Json(json!({ "task": task }))))
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    pub device_id: Option<String>,
    pub agent_id: Option<String>,
}

async fn claim_task(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(body): Json<ClaimRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.device_id.is_none() && body.agent_id.is_none() {
        return Err(AppError::BadRequest("device_id or agent_id is required".into()));
    }

    let lease_secs = state.config.task_lease_secs;
    let db = state.db.clone();
    let task = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        task::claim(
            &conn,
            &user.user_id,
            body.device_id.as_deref(),
            body.agent_id.as_deref(),
            lease_secs,
        )
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    // An empty queue is a normal answer for a polling agent, not an error.
    Ok(Json(json!({ "task": task })))
}

#[derive(Deserialize)]
pub struct CompleteTaskRequest {
    #[serde(default)]
    pub status: String,
    pub error: Option<String>,
}

async fn complete_task(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<CompleteTaskRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = match body.status.trim().to_ascii_uppercase().as_str() {
        "DONE" => "DONE",
        "ERROR" => "ERROR",
        other => {
            return Err(AppError::BadRequest(format!(
                "Invalid completion status: {:?}",
                other
            )))
        }
    };

    let db = state.db.clone();
    let task = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        // 404 for other users' tasks: existence is not leaked across accounts.
        task::find_by_id_for_user(&conn, &id, &user.user_id)?
            .ok_or_else(|| AppError::NotFound("Task not found".into()))?;
        match task::complete(&conn, &id, &user.user_id, status, body.error.as_deref())? {
            Some(t) => Ok(t),
            None => Err(AppError::Conflict("Task is not running".into())),
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    Ok(Json(json!({ "task": task })))
}

#[derive(Deserialize)]
pub struct ListTasksQuery {
    pub device_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<String>,
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let limit = parse_limit(query.limit.as_deref())?;
    let status = match query.status.as_deref() {
        None => None,
        Some(s) => Some(
            task::stored_status_filter(s)
                .ok_or_else(|| AppError::BadRequest(format!("Invalid status filter: {:?}", s)))?,
        ),
    };

    let db = state.db.clone();
    let tasks = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        task::find_for_user(
            &conn,
            &user.user_id,
            query.device_id.as_deref(),
            status,
            limit,
        )
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    Ok(Json(json!({ "tasks": tasks })))
}

pub(crate) fn parse_limit(raw: Option<&str>) -> Result<i64, AppError> {
    let limit = match raw {
        None => 50,
        Some(v) => v
            .parse::<i64>()
            .map_err(|_| AppError::BadRequest("limit must be a number".into()))?,
    };
    if !(1..=500).contains(&limit) {
        return Err(AppError::BadRequest("limit must be between 1 and 500".into()));
    }
    Ok(limit)
}
