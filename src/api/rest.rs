// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires the `AuthBearer` extractor. CORS is permissive.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::{AddSubscriberRequest, AppState};
use crate::error::FeedError;
use crate::types::SubscriberId;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/subscribers", get(list_subscribers).post(add_subscriber))
        .route(
            "/api/v1/subscribers/:id",
            get(get_subscriber).delete(remove_subscriber),
        )
        .route("/api/v1/subscribers/:id/bars", get(subscriber_bars))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

/// `FeedError` rendered as a JSON `{error}` body.
pub struct ApiError(FeedError);

impl From<FeedError> for ApiError {
    fn from(err: FeedError) -> Self {
        Self(err)
    }
}

fn status_of(err: &FeedError) -> StatusCode {
    match err {
        FeedError::SubscriberNotFound(_) => StatusCode::NOT_FOUND,
        FeedError::InvalidRequest(_)
        | FeedError::InvalidPayload { .. }
        | FeedError::SubscriberDone(_) => StatusCode::BAD_REQUEST,
        FeedError::Transport(_)
        | FeedError::NotConnected
        | FeedError::Closing
        | FeedError::Rest(_)
        | FeedError::AuthForbidden
        | FeedError::AuthTransport(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(&self.0);
        if status.is_server_error() {
            warn!(status = %status, error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

fn parse_id(raw: &str) -> Result<SubscriberId, ApiError> {
    raw.parse().map_err(ApiError)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

// =============================================================================
// Subscribers (authenticated)
// =============================================================================

async fn list_subscribers(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.subscribers())
}

async fn add_subscriber(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddSubscriberRequest>,
) -> Result<Response, ApiError> {
    let id = state.add_subscriber(request).await?;
    info!(subscriber = %id, "subscriber added via API");
    let body = serde_json::json!({ "id": id });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn get_subscriber(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let info = state.subscriber(parse_id(&id)?)?;
    Ok(Json(info).into_response())
}

async fn remove_subscriber(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    state.remove_subscriber(id).await?;
    info!(subscriber = %id, "subscriber removed via API");
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
struct BarsQuery {
    #[serde(default)]
    heiken_ashi: bool,
}

async fn subscriber_bars(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<BarsQuery>,
) -> Result<Response, ApiError> {
    let bars = state.bars(parse_id(&id)?, query.heiken_ashi)?;
    Ok(Json(bars).into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::api::auth::ADMIN_TOKEN_ENV;
    use crate::auth::TokenProvider;
    use crate::config::FeedConfig;

    const TOKEN: &str = "test-admin-token";

    fn app() -> Router {
        std::env::set_var(ADMIN_TOKEN_ENV, TOKEN);
        let token = Arc::new(TokenProvider::new("http://127.0.0.1:1", "r").unwrap());
        let state = AppState::new(FeedConfig::default(), token).unwrap();
        router(Arc::new(state))
    }

    fn get_request(uri: &str, authorized: bool) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if authorized {
            builder = builder.header("authorization", format!("Bearer {TOKEN}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = app().oneshot(get_request("/api/v1/health", false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connection"], "disconnected");
    }

    #[tokio::test]
    async fn subscribers_require_token() {
        let response = app().oneshot(get_request("/api/v1/subscribers", false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app().oneshot(get_request("/api/v1/subscribers", true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids() {
        let unknown = format!("/api/v1/subscribers/{}", SubscriberId::new());
        let response = app().oneshot(get_request(&unknown, true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app()
            .oneshot(get_request("/api/v1/subscribers/not-a-uuid/bars", true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn add_without_feed_is_bad_gateway() {
        let body = serde_json::json!({
            "instrument": {"exchange": "MOEX", "code": "SBER", "board": "TQBR", "timeframe": 60}
        });
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/subscribers")
            .header("authorization", format!("Bearer {TOKEN}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn error_statuses() {
        assert_eq!(status_of(&FeedError::NoBarsAvailable), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_of(&FeedError::Rest("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_of(&FeedError::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
