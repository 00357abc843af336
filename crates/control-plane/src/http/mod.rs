use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use subtle::ConstantTimeEq;

use common::api::{
    Key, KeyView, Server, ServerView, SettingsView, StoreKeyRequest, StoreServerRequest,
    UpdateKeyRequest, UpdateServerRequest,
};

use crate::coordinator::Coordinator;
use crate::error::{ApiResult, AppError};
use crate::persistence::{Database, NewKey, NewServer};

mod keys;
mod servers;
mod settings;
mod system;

/// Shared application state passed into handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub coordinator: Arc<Coordinator>,
    pub http_port: u16,
}

pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/settings", get(settings::show).post(settings::update))
        .route(
            "/keys",
            get(keys::index).post(keys::store).put(keys::update),
        )
        .route("/keys/{id}", delete(keys::destroy))
        .route("/keys/refill", post(keys::refill))
        .route(
            "/servers",
            get(servers::index)
                .post(servers::store)
                .put(servers::update),
        )
        .route("/servers/{id}", delete(servers::destroy))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_auth,
        ));

    Router::new()
        .route("/health", get(system::health))
        .route("/metrics", get(system::metrics))
        .nest("/v1", v1)
        .with_state(state)
}

/// Bearer authentication against the node's api token; both operators and
/// fleet peers authenticate this way.
async fn require_api_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let expected = state.db.settings().await.api_token;
    let authorized = bearer_token(request.headers())
        .map(|provided| token_matches(provided, &expected))
        .unwrap_or(false);

    if !authorized {
        return AppError::unauthorized("invalid api token").into_response();
    }
    next.run(request).await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn token_matches(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Every successful admin mutation triggers a full fleet resync in the
/// background.
fn spawn_sync(state: &AppState) {
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        coordinator.sync().await;
    });
}

/// Scale a byte total by the accounting ratio and report megabytes.
fn used_megabytes(total: u64, ratio: f64) -> u64 {
    ((total as f64 * ratio) as u64) / 1_000_000
}
