use super::{export, rate_limit, translations, ApiError, AppState};
use crate::security;
use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let export_routes = Router::new()
        .route("/api/v1/export/:locale", get(export::export_locale))
        .route_layer(middleware::from_fn_with_state(
            state.export_limiter.clone(),
            rate_limit::enforce,
        ));

    // Layers wrap outward: authentication runs before the rate limiter
    let translation_routes = Router::new()
        .route(
            "/api/v1/translations",
            get(translations::index).post(translations::store),
        )
        .route(
            "/api/v1/translations/:id",
            get(translations::show)
                .put(translations::update)
                .delete(translations::destroy),
        )
        .route_layer(middleware::from_fn_with_state(
            state.crud_limiter.clone(),
            rate_limit::enforce,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(export_routes)
        .merge(translation_routes)
        .route("/health", get(health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !security::is_authorized(request.headers(), state.api_key.as_deref()) {
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "metrics": state.metrics.report() }))
}

async fn not_found() -> ApiError {
    ApiError::RouteNotFound
}
