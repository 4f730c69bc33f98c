use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;

use crate::auth;
use crate::blobstore::{ImageStore, object_key};
use crate::db::DbHandle;
#[cfg(test)]
use crate::db::OrdersDb;
use crate::errors::StoreError;
use crate::models::{DraftSummary, OrderStatus, User, UserProfile};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub images: Arc<dyn ImageStore>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub login: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct UpdateProfileRequest {
    pub login: Option<String>,
    pub password: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateWorkshopRequest {
    pub name: String,
    pub description: Option<String>,
    pub era: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateWorkshopRequest {
    pub name: String,
    pub description: String,
    pub era: String,
}

#[derive(Deserialize)]
pub struct WorkshopsQuery {
    pub name: Option<String>,
}

#[derive(Deserialize)]
pub struct ItemRequest {
    pub workshop_id: i64,
    pub found_defects: Option<i64>,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub production_name: String,
}

#[derive(Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::Forbidden(_) => ApiError::Forbidden(err.to_string()),
            StoreError::Conflict(_) => ApiError::Conflict(err.to_string()),
            StoreError::BadRequest(_) => ApiError::BadRequest(err.to_string()),
            StoreError::Storage(e) => {
                tracing::error!("storage failure: {:#}", e);
                ApiError::Internal("internal server error".to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/workshops", get(list_workshops).post(create_workshop))
        .route(
            "/api/workshops/{id}",
            get(get_workshop).put(update_workshop).delete(delete_workshop),
        )
        .route("/api/workshops/{id}/image", post(upload_workshop_image))
        .route("/api/draft", get(get_draft))
        .route(
            "/api/draft/items",
            post(add_draft_item).put(update_draft_item).delete(remove_draft_item),
        )
        .route("/api/orders", get(list_orders))
        .route(
            "/api/orders/{id}",
            get(get_order).put(rename_order).delete(delete_order),
        )
        .route("/api/orders/{id}/form", put(form_order))
        .route("/api/orders/{id}/complete", put(complete_order))
        .route("/api/users/register", post(register))
        .route("/api/users/login", post(login))
        .route("/api/users/logout", post(logout))
        .route("/api/users/me", get(get_profile).put(update_profile))
        .route("/health", get(health_check))
}

// ── Auth helpers ──────────────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.to_string())
        .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
}

async fn require_user(state: &SharedState, headers: &HeaderMap) -> Result<User, ApiError> {
    let token = bearer_token(headers)?;
    let user = state.db.call(move |db| db.get_session_user(&token)).await?;
    user.ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
}

async fn require_moderator(state: &SharedState, headers: &HeaderMap) -> Result<User, ApiError> {
    let user = require_user(state, headers).await?;
    if !user.is_moderator {
        return Err(ApiError::Forbidden("moderator role required".to_string()));
    }
    Ok(user)
}

/// Argon2 hashing is deliberately slow; keep it off the async workers.
async fn hash_password_blocking(password: String) -> Result<String, ApiError> {
    let result = tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(|e| ApiError::Internal(format!("hash task panicked: {}", e)))?;
    result.map_err(|e| {
        tracing::error!("password hashing failed: {:#}", e);
        ApiError::Internal("internal server error".to_string())
    })
}

async fn verify_password_blocking(
    password: String,
    stored_hash: String,
) -> Result<bool, ApiError> {
    let result =
        tokio::task::spawn_blocking(move || auth::verify_password(&password, &stored_hash))
            .await
            .map_err(|e| ApiError::Internal(format!("hash task panicked: {}", e)))?;
    result.map_err(|e| {
        tracing::error!("password verification failed: {:#}", e);
        ApiError::Internal("internal server error".to_string())
    })
}

fn parse_date(value: Option<&str>) -> Result<Option<chrono::NaiveDate>, ApiError> {
    match value {
        Some(s) => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| {
                ApiError::BadRequest(format!("invalid date '{}', expected YYYY-MM-DD", s))
            }),
        None => Ok(None),
    }
}

// ── Workshop handlers ─────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_workshops(
    State(state): State<SharedState>,
    Query(query): Query<WorkshopsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let name = query.name;
    let workshops = state
        .db
        .call(move |db| db.list_workshops(name.as_deref()))
        .await?;
    Ok(Json(workshops))
}

async fn create_workshop(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateWorkshopRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_moderator(&state, &headers).await?;
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    let name = req.name;
    let description = req.description.unwrap_or_default();
    let era = req.era.unwrap_or_default();
    let workshop = state
        .db
        .call(move |db| db.create_workshop(&name, &description, &era))
        .await?;
    Ok((StatusCode::CREATED, Json(workshop)))
}

async fn get_workshop(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let workshop = state.db.call(move |db| db.get_workshop(id)).await?;
    match workshop {
        Some(workshop) => Ok(Json(workshop)),
        None => Err(ApiError::NotFound(format!("workshop {} not found", id))),
    }
}

async fn update_workshop(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<UpdateWorkshopRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_moderator(&state, &headers).await?;
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    let UpdateWorkshopRequest {
        name,
        description,
        era,
    } = req;
    let workshop = state
        .db
        .call(move |db| db.update_workshop(id, &name, &description, &era))
        .await?;
    Ok(Json(workshop))
}

async fn delete_workshop(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_moderator(&state, &headers).await?;
    let workshop = state.db.call(move |db| db.delete_workshop(id)).await?;
    // Best-effort purge of stored images; the soft delete already happened.
    for key in [workshop.image_key, workshop.extra_image_key] {
        if !key.is_empty() {
            if let Err(e) = state.images.remove(&key).await {
                tracing::warn!("failed to remove image object {}: {:#}", key, e);
            }
        }
    }
    tracing::info!("workshop {} deleted", id);
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_workshop_image(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    require_moderator(&state, &headers).await?;
    let workshop = state
        .db
        .call(move |db| {
            db.get_workshop(id)?
                .ok_or_else(|| StoreError::NotFound(format!("workshop {}", id)))
        })
        .await?;

    let mut new_image_key: Option<String> = None;
    let mut new_extra_key: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name != "image" && name != "extra_image" {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.bin").to_string();
        let content_type = field
            .content_type()
            .map(|ct| ct.to_string())
            .unwrap_or_else(|| mime_guess::from_path(&filename).first_or_octet_stream().to_string());
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read field '{}': {}", name, e)))?;

        let old_key = if name == "image" {
            workshop.image_key.clone()
        } else {
            workshop.extra_image_key.clone()
        };
        if !old_key.is_empty() {
            if let Err(e) = state.images.remove(&old_key).await {
                tracing::warn!("failed to remove old image object {}: {:#}", old_key, e);
            }
        }

        let key = object_key(&filename);
        state
            .images
            .put(&key, data.to_vec(), &content_type)
            .await
            .map_err(|e| {
                tracing::error!("image upload failed: {:#}", e);
                ApiError::Internal("image upload failed".to_string())
            })?;
        if name == "image" {
            new_image_key = Some(key);
        } else {
            new_extra_key = Some(key);
        }
    }

    if new_image_key.is_none() && new_extra_key.is_none() {
        return Err(ApiError::BadRequest(
            "multipart field 'image' or 'extra_image' is required".to_string(),
        ));
    }

    let workshop = state
        .db
        .call(move |db| db.set_workshop_images(id, new_image_key.as_deref(), new_extra_key.as_deref()))
        .await?;
    Ok(Json(workshop))
}

// ── Draft and line item handlers ──────────────────────────────────────

async fn get_draft(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    let summary = state
        .db
        .call(move |db| {
            let draft = db.find_or_create_draft(user.id)?;
            let item_count = db.count_order_items(draft.id)?;
            Ok(DraftSummary {
                order_id: draft.id,
                item_count,
            })
        })
        .await?;
    Ok(Json(summary))
}

async fn add_draft_item(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<ItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    let workshop_id = req.workshop_id;
    let item = state
        .db
        .call(move |db| {
            let draft = db.find_or_create_draft(user.id)?;
            db.add_item(draft.id, workshop_id)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn update_draft_item(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<ItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    let found_defects = req
        .found_defects
        .ok_or_else(|| ApiError::BadRequest("found_defects is required".to_string()))?;
    let workshop_id = req.workshop_id;
    let item = state
        .db
        .call(move |db| {
            let draft = db
                .get_draft_for_user(user.id)?
                .ok_or_else(|| StoreError::NotFound("draft order".to_string()))?;
            db.update_item(draft.id, workshop_id, found_defects)
        })
        .await?;
    Ok(Json(item))
}

async fn remove_draft_item(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<ItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    let workshop_id = req.workshop_id;
    state
        .db
        .call(move |db| {
            let draft = db
                .get_draft_for_user(user.id)?
                .ok_or_else(|| StoreError::NotFound("draft order".to_string()))?;
            db.remove_item(draft.id, workshop_id)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Order handlers ────────────────────────────────────────────────────

async fn list_orders(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListOrdersQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&state, &headers).await?;
    let status = match &query.status {
        Some(s) => Some(OrderStatus::from_str(s).map_err(ApiError::BadRequest)?),
        None => None,
    };
    let date_from = parse_date(query.date_from.as_deref())?;
    let date_to = parse_date(query.date_to.as_deref())?;
    let orders = state
        .db
        .call(move |db| db.list_orders(status, date_from, date_to))
        .await?;
    Ok(Json(orders))
}

async fn get_order(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    let detail = state
        .db
        .call(move |db| db.get_order_detail(id, &user))
        .await?;
    Ok(Json(detail))
}

async fn rename_order(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<RenameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    let name = req.production_name;
    let order = state
        .db
        .call(move |db| db.rename_order(id, user.id, &name))
        .await?;
    Ok(Json(order))
}

async fn form_order(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    let order = state.db.call(move |db| db.form_order(id, user.id)).await?;
    tracing::info!("order {} formed by user {}", order.id, user.id);
    Ok(Json(order))
}

async fn complete_order(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let moderator = require_moderator(&state, &headers).await?;
    let order = state
        .db
        .call(move |db| db.complete_order(id, moderator.id))
        .await?;
    tracing::info!("order {} completed by moderator {}", order.id, moderator.id);
    Ok(Json(order))
}

async fn delete_order(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    state
        .db
        .call(move |db| db.delete_order(id, user.id))
        .await?;
    tracing::info!("order {} deleted by user {}", id, user.id);
    Ok(StatusCode::NO_CONTENT)
}

// ── User handlers ─────────────────────────────────────────────────────

async fn register(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.login.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "login and password are required".to_string(),
        ));
    }
    let password_hash = hash_password_blocking(req.password).await?;
    let login = req.login;
    let user = state
        .db
        .call(move |db| db.create_user(&login, &password_hash, false))
        .await?;
    tracing::info!("registered user {} ({})", user.login, user.id);
    Ok((StatusCode::CREATED, Json(UserProfile::from(user))))
}

async fn login(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.login.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "login and password are required".to_string(),
        ));
    }
    let login = req.login;
    let user = state
        .db
        .call(move |db| db.get_user_by_login(&login))
        .await?;
    // Unknown login and wrong password must be indistinguishable.
    let user =
        user.ok_or_else(|| ApiError::Unauthorized("invalid login or password".to_string()))?;
    let valid = verify_password_blocking(req.password, user.password_hash.clone()).await?;
    if !valid {
        return Err(ApiError::Unauthorized(
            "invalid login or password".to_string(),
        ));
    }
    let token = auth::new_session_token();
    let token_for_db = token.clone();
    state
        .db
        .call(move |db| db.create_session(&token_for_db, user.id))
        .await?;
    Ok(Json(serde_json::json!({"token": token})))
}

async fn logout(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&state, &headers).await?;
    let token = bearer_token(&headers)?;
    state.db.call(move |db| db.delete_session(&token)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_profile(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    Ok(Json(UserProfile::from(user)))
}

async fn update_profile(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    if matches!(req.login.as_deref(), Some("")) {
        return Err(ApiError::BadRequest("login must not be empty".to_string()));
    }
    if matches!(req.password.as_deref(), Some("")) {
        return Err(ApiError::BadRequest(
            "password must not be empty".to_string(),
        ));
    }
    let password_hash = match req.password {
        Some(p) => Some(hash_password_blocking(p).await?),
        None => None,
    };
    let login = req.login;
    let updated = state
        .db
        .call(move |db| db.update_user(user.id, login.as_deref(), password_hash.as_deref()))
        .await?;
    Ok(Json(UserProfile::from(updated)))
}

// ── Tests ─────────────────────────────────────────────────────────────
