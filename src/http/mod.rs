//! HTTP/SSE Surface (spec §4.7, component C7): maps requests onto the
//! registry/session operations, serves the SSE stream, and authenticates
//! every route but `/api/health`.

pub mod auth;
pub mod fs;
pub mod rate_limit;
pub mod sessions;

use crate::registry::Registry;
use crate::supervisor::Supervisor;
use auth::TokenManager;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use rate_limit::RateLimiter;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Shared state reachable from every handler.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub supervisor: Arc<Supervisor>,
    pub token_manager: Arc<TokenManager>,
    pub rate_limiter: RateLimiter,
}

/// Assembles the router described in spec §4.7. `static_path`, when
/// given, mounts a fallback `ServeDir` for the browser client's assets
/// (spec.md §6 names `--static-path` without elaborating the mechanism;
/// SPEC_FULL §C.5 resolves it to `tower_http::services::ServeDir`, the
/// way the rest of the corpus serves static assets alongside an API).
pub fn build_router(state: Arc<AppState>, static_path: Option<std::path::PathBuf>) -> Router {
    let authenticated = Router::new()
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions", post(sessions::create_session))
        .route("/api/sessions/:id", delete(sessions::delete_session))
        .route(
            "/api/sessions/:id/cleanup",
            delete(sessions::cleanup_session),
        )
        .route("/api/sessions/:id/stream", get(sessions::stream_session))
        .route("/api/sessions/:id/snapshot", get(sessions::snapshot_session))
        .route("/api/sessions/:id/cast", get(sessions::cast_session))
        .route("/api/sessions/:id/input", post(sessions::send_input))
        .route("/api/cleanup-exited", post(sessions::cleanup_exited))
        .route("/api/fs/browse", get(fs::browse))
        .route("/api/mkdir", post(fs::mkdir))
        .layer(middleware::from_fn_with_state(
            state.token_manager.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit::enforce,
        ));

    let mut router = Router::new()
        .route("/api/health", get(sessions::health))
        .merge(authenticated)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(dir) = static_path {
        router = router.fallback_service(ServeDir::new(dir));
    }
    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventloop::EventLoop;
    use crate::registry::{Registry, SessionFd};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    async fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        let control_root = tempfile::tempdir().unwrap();
        let config = crate::config::ServerConfig::new(Some(control_root.path().to_path_buf()), None);
        let event_loop = Arc::new(EventLoop::<SessionFd>::new().unwrap());
        let registry = Arc::new(Registry::new(config.clone(), event_loop));
        let (token_manager, _) =
            TokenManager::load_or_bootstrap(config.control_root.join("tokens.json")).await.unwrap();
        let state = Arc::new(AppState {
            registry,
            supervisor: Supervisor::new(),
            token_manager,
            rate_limiter: RateLimiter::new(rate_limit::RateLimitConfig::default()),
        });
        (state, control_root)
    }

    /// `/api/health` must answer without a bearer token, driven straight
    /// through the router (no bound socket) the way the teacher's own
    /// handler tests do.
    #[tokio::test]
    async fn health_route_is_reachable_without_binding_a_socket() {
        let (state, _root) = test_state().await;
        let app = build_router(state, None);

        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
