use crate::catalog::{CatalogError, ValidationErrors};
use crate::export::ExportError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

/// Error responses of the HTTP API. Bodies are always JSON.
#[derive(Debug)]
pub enum ApiError {
    LanguageNotFound,
    TranslationNotFound,
    RouteNotFound,
    Unauthorized,
    BadRequest(String),
    Validation(ValidationErrors),
    TooManyRequests { retry_after_secs: u64 },
    BuildTimeout,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::LanguageNotFound => {
                (StatusCode::NOT_FOUND, json!({ "error": "Language not found" }))
            }
            ApiError::TranslationNotFound => {
                (StatusCode::NOT_FOUND, json!({ "error": "Translation not found" }))
            }
            ApiError::RouteNotFound => (StatusCode::NOT_FOUND, json!({ "error": "Not Found" })),
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, json!({ "error": "Unauthenticated." }))
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
            ApiError::Validation(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "message": "The given data was invalid.", "errors": errors }),
            ),
            ApiError::TooManyRequests { retry_after_secs } => {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", retry_after_secs.to_string())],
                    Json(json!({ "error": "Too Many Requests" })),
                )
                    .into_response();
            }
            ApiError::BuildTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({ "error": "Export timed out" }),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Internal server error" }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ExportError> for ApiError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::LocaleNotFound(_) => ApiError::LanguageNotFound,
            ExportError::BuildTimeout(_) => ApiError::BuildTimeout,
            // Already logged by the export service
            ExportError::BuildFailure(_) => ApiError::Internal,
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Validation(errors) => ApiError::Validation(errors),
            CatalogError::NotFound(_) => ApiError::TranslationNotFound,
            CatalogError::Store(e) => {
                error!(error = %e, "Catalog store error");
                ApiError::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::time::Duration;

    #[test]
    fn test_export_errors_map_to_statuses() {
        let not_found: ApiError = ExportError::LocaleNotFound("xx".to_string()).into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let timeout: ApiError = ExportError::BuildTimeout(Duration::from_secs(2)).into();
        assert_eq!(timeout.into_response().status(), StatusCode::GATEWAY_TIMEOUT);

        let failure: ApiError = ExportError::BuildFailure("down".to_string()).into();
        assert_eq!(
            failure.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_duplicate_key_is_unprocessable() {
        let err: ApiError = CatalogError::from(StoreError::DuplicateKey("greeting".to_string())).into();
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_too_many_requests_sets_retry_after() {
        let response = ApiError::TooManyRequests {
            retry_after_secs: 42,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "42");
    }
}
