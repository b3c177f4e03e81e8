use crate::auth::AuthUser;
use crate::error::AppError;
use crate::models::job::{self, JobState, JobView};
use crate::routes::tasks::parse_limit;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_jobs))
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<String>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let limit = parse_limit(query.limit.as_deref())?;
    let state_filter = match query.status.as_deref() {
        None => None,
        Some(s) => Some(
            JobState::parse(s)
                .ok_or_else(|| AppError::BadRequest(format!("Invalid status filter: {:?}", s)))?,
        ),
    };

    let db = state.db.clone();
    let jobs = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        job::find_for_user(
            &conn,
            &user.user_id,
            query.device_id.as_deref(),
            state_filter,
            limit,
        )
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let jobs: Vec<JobView> = jobs.into_iter().map(JobView::from).collect();
    Ok(Json(json!({ "jobs": jobs })))
}
