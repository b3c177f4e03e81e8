pub mod rate_limit;

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Authenticated caller, resolved from the `Authorization: Bearer` header
/// against the token store. The server never sees passwords; tokens are
/// provisioned out of band and only their hashes are persisted.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".into()))?;

        let token = header
            .strip_prefix("Bearer ")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::Unauthorized("Expected a bearer token".into()))?;

        let token_hash = hash_token(token);
        let db = state.db.clone();
        let user_id = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            crate::models::token::verify(&conn, &token_hash)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        match user_id {
            Some(user_id) => Ok(AuthUser { user_id }),
            None => Err(AppError::Unauthorized("Invalid or revoked token".into())),
        }
    }
}
