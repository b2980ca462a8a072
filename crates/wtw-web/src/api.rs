//! JSON API mirroring the opinion pages.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tracing::warn;
use wtw_core::{Opinion, OpinionPayload, ValidationError};
use wtw_storage::StorageError;

use crate::AppState;

pub const DUPLICATE_TEXT_MESSAGE: &str = "This opinion already exists in the database";
pub const EMPTY_STORE_MESSAGE: &str = "There are no opinions in the database";
pub const NOT_FOUND_MESSAGE: &str = "Opinion not found";
pub const INVALID_FIELDS_MESSAGE: &str = "Opinion fields are empty or too long";

/// API error rendered as `{"message": ...}` with a matching status.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// Logged server-side; the client only sees a generic message.
    Internal(anyhow::Error),
}

impl ApiError {
    fn not_found() -> Self {
        Self::NotFound(NOT_FOUND_MESSAGE.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Internal(err) => {
                tracing::error!(error = ?err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => Self::not_found(),
            StorageError::Duplicate(_) => Self::BadRequest(DUPLICATE_TEXT_MESSAGE.to_string()),
            StorageError::ConstraintViolation(msg) => {
                warn!(error = %msg, "store rejected opinion fields");
                Self::BadRequest(INVALID_FIELDS_MESSAGE.to_string())
            }
            other => Self::Internal(other.into()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/opinions/", get(list_opinions).post(create_opinion))
        .route(
            "/api/opinions/{id}/",
            get(get_opinion).patch(update_opinion).delete(delete_opinion),
        )
        .route("/api/get-random-opinion/", get(random_opinion))
}

async fn find_opinion(state: &AppState, raw_id: &str) -> Result<Opinion, ApiError> {
    let id: i64 = raw_id.parse().map_err(|_| ApiError::not_found())?;
    state.store.get(id).await?.ok_or_else(ApiError::not_found)
}

async fn get_opinion(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let opinion = find_opinion(&state, &id).await?;
    Ok(Json(json!({ "opinion": opinion })))
}

async fn update_opinion(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<OpinionPayload>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let mut opinion = find_opinion(&state, &id).await?;
    let Json(payload) = payload?;
    if !payload.has_required_fields() {
        return Err(ValidationError::MissingFields.into());
    }
    if let Some(text) = &payload.text {
        if state.store.text_exists(text, Some(opinion.id)).await? {
            warn!(id = opinion.id, "update rejected: duplicate text");
            return Err(ApiError::BadRequest(DUPLICATE_TEXT_MESSAGE.to_string()));
        }
    }

    opinion.apply(&payload);
    opinion.validate()?;
    let updated = state.store.update(&opinion).await?;
    Ok(Json(json!({ "opinion": updated })))
}

async fn delete_opinion(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let opinion = find_opinion(&state, &id).await?;
    if !state.store.delete(opinion.id).await? {
        return Err(ApiError::not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_opinions(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let opinions = state.store.list().await?;
    Ok(Json(json!({ "opinions": opinions })))
}

async fn create_opinion(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<OpinionPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(payload) = payload?;
    let new = payload.into_new_opinion()?;
    if state.store.text_exists(&new.text, None).await? {
        warn!("create rejected: duplicate text");
        return Err(ApiError::BadRequest(DUPLICATE_TEXT_MESSAGE.to_string()));
    }
    let created = state.store.insert(&new).await?;
    Ok((StatusCode::CREATED, Json(json!({ "opinion": created }))))
}

async fn random_opinion(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let opinion = state
        .store
        .random()
        .await?
        .ok_or_else(|| ApiError::NotFound(EMPTY_STORE_MESSAGE.to_string()))?;
    Ok(Json(json!({ "opinion": opinion })))
}
