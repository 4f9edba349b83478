//! Process bootstrap: wires the registry, event loop, supervisor, and
//! HTTP surface together and runs them to completion (spec §4.7 surface,
//! §4.8 supervisor, §5 concurrency model).
//!
//! Binds a `TcpListener`, builds the `axum::Router` with `ConnectInfo`
//! available for per-IP rate limiting, and runs with
//! `with_graceful_shutdown` driven by a Ctrl-C/SIGTERM select.

use crate::config::ServerConfig;
use crate::eventloop::EventLoop;
use crate::http::auth::TokenManager;
use crate::http::rate_limit::{RateLimitConfig, RateLimiter};
use crate::http::{build_router, AppState};
use crate::registry::Registry;
use crate::supervisor::{self, EventLoopProbe, HealthProbe, Supervisor};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub async fn run(config: ServerConfig, port: u16, host: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.control_root)
        .map_err(|e| crate::error::FatalError::ControlRoot { path: config.control_root.clone(), source: e })?;

    let event_loop = Arc::new(EventLoop::new()?);
    let registry = Arc::new(Registry::new(config.clone(), event_loop.clone()));
    registry.recover_on_startup();

    let registry_for_worker = registry.clone();
    std::thread::Builder::new()
        .name("pty-event-loop".to_string())
        .spawn(move || registry_for_worker.run_event_loop())
        .expect("failed to spawn event loop worker thread");

    let token_store = config.control_root.join("tokens.json");
    let (token_manager, minted) = TokenManager::load_or_bootstrap(token_store).await?;
    if let Some(token) = minted {
        info!("generated API token (store it now, it will not be printed again): {token}");
    }

    let supervisor = Supervisor::new();
    supervisor.run_startup_cleanup(registry.clone(), config.cleanup_on_startup).await;

    let probe: Arc<dyn HealthProbe> = Arc::new(EventLoopProbe::new(event_loop.clone()));
    supervisor.spawn_health_monitor(probe, |attempt| async move {
        tracing::error!(attempt, "restart policy invoked, but this process is the whole server: \
            operators should run it under a process supervisor (systemd, launchd) for actual \
            process-level restart; this hook exists so embedding code can react to repeated failures");
    });

    let rate_limiter = RateLimiter::new(RateLimitConfig::default());
    let sweep_limiter = rate_limiter.clone();
    supervisor.track(tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            interval.tick().await;
            sweep_limiter.cleanup_stale().await;
        }
    }));

    let state = Arc::new(AppState {
        registry: registry.clone(),
        supervisor: supervisor.clone(),
        token_manager,
        rate_limiter,
    });

    let app = build_router(state, config.static_path.clone());

    let addr_str = format!("{host}:{port}");
    let addr: std::net::SocketAddr = addr_str
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {addr_str}: {e}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| crate::error::FatalError::Bind { addr, source: e })?;

    info!(%addr, control_root = %config.control_root.display(), "session server listening");

    let shutdown_registry = registry.clone();
    let shutdown_supervisor = supervisor.clone();
    let shutdown_event_loop = event_loop.clone();
    let result = axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(async move {
            supervisor::wait_for_shutdown_signal().await;
            info!("starting graceful shutdown");
            shutdown_event_loop.stop();
            supervisor::kill_all_sessions(&shutdown_registry).await;
            shutdown_supervisor.shutdown().await;
        })
        .await;

    info!("server shut down");
    result.map_err(anyhow::Error::from)
}
