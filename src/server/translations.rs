//! Authenticated catalog CRUD under `/api/v1/translations`.

use super::{ApiError, AppState};
use crate::catalog::TranslationInput;
use crate::store::{TranslationFilter, TranslationRecord};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct TranslationResource {
    pub id: i64,
    pub key: String,
    pub default_value: String,
    pub translations: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TranslationRecord> for TranslationResource {
    fn from(record: TranslationRecord) -> Self {
        Self {
            id: record.id,
            key: record.key,
            default_value: record.default_value,
            translations: record.texts,
            tags: record.tags,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub tag: Option<String>,
    pub key: Option<String>,
    pub content: Option<String>,
    pub page: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Non-numeric ids cannot name a translation.
fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse().map_err(|_| ApiError::TranslationNotFound)
}

fn body(payload: Result<Json<TranslationInput>, JsonRejection>) -> Result<TranslationInput, ApiError> {
    payload
        .map(|Json(input)| input)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn data(record: TranslationRecord) -> Json<Value> {
    Json(json!({ "data": TranslationResource::from(record) }))
}

pub async fn index(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let page = params
        .page
        .as_deref()
        .and_then(|p| p.parse::<u32>().ok())
        .unwrap_or(1);
    let filter = TranslationFilter {
        tag: non_empty(params.tag),
        key: non_empty(params.key),
        content: non_empty(params.content),
    };

    let page = state.catalog.list(&filter, page).await?;
    let last_page = page.last_page();
    let items: Vec<TranslationResource> = page.items.into_iter().map(Into::into).collect();

    Ok(Json(json!({
        "data": items,
        "meta": {
            "current_page": page.page,
            "per_page": page.per_page,
            "total": page.total,
            "last_page": last_page,
        }
    })))
}

pub async fn store(
    State(state): State<AppState>,
    payload: Result<Json<TranslationInput>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.catalog.create(body(payload)?).await?;
    Ok((StatusCode::CREATED, data(record)))
}

pub async fn show(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.catalog.get(parse_id(&id)?).await?;
    Ok(data(record))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<TranslationInput>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let record = state.catalog.update(id, body(payload)?).await?;
    Ok(data(record))
}

pub async fn destroy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.catalog.delete(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}
