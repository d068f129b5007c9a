use super::{ApiError, AppState};
use crate::locales::is_locale_code;
use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use tracing::debug;

/// `GET /api/v1/export/:locale`: the locale's key → text object.
pub async fn export_locale(
    State(state): State<AppState>,
    Path(locale): Path<String>,
) -> Result<Response, ApiError> {
    if !is_locale_code(&locale) {
        debug!(locale = %locale, "Rejected malformed locale code");
        return Err(ApiError::LanguageNotFound);
    }

    let export = state.exports.export(&locale).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        export.as_json().to_string(),
    )
        .into_response())
}
