pub mod handlers;
pub mod state;
pub mod url_validation;

use crate::config::Config;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    response::Response,
    routing::{get, post},
};
use state::AppState;
use std::time::Duration;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Header carrying the relay version on every response
pub const VERSION_HEADER: &str = "x-hlsrelay-version";

/// Build the router with fresh state for `config`.
pub fn build_router(config: Config) -> Result<Router, reqwest::Error> {
    Ok(router(AppState::new(config)?))
}

/// Wire routes, CORS and the version header around existing state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
        .allow_headers([header::RANGE, header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([
            header::CONTENT_LENGTH,
            header::CONTENT_RANGE,
            header::ACCEPT_RANGES,
        ])
        .max_age(Duration::from_secs(86400));

    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/keepalive", get(handlers::health::keepalive))
        .route("/test-bypass", get(handlers::bypass::test_bypass))
        .route("/metrics", get(handlers::metrics::metrics_handler))
        .route("/playlist.m3u8", get(handlers::playlist::serve_playlist))
        .route("/stream", get(handlers::stream::serve_stream))
        .route("/mx", get(handlers::mx::serve_mx))
        .route(
            "/segment/{session_id}/{reference}",
            get(handlers::segment::serve_segment),
        )
        .route("/select", post(handlers::select::select_stream))
        .with_state(state)
        .layer(cors)
        .layer(middleware::map_response(version_header))
}

async fn version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);
    let cleanup_interval = config.cleanup_interval();

    let state = AppState::new(config)?;
    spawn_cleanup(state.clone(), cleanup_interval);

    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("🚀 Relay listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Periodically evict idle sessions and their cached playlists.
pub fn spawn_cleanup(state: AppState, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = state.cleanup_sessions();
            if !evicted.is_empty() {
                info!(
                    "Cleanup evicted {} sessions, {} remain",
                    evicted.len(),
                    state.sessions.session_count()
                );
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
