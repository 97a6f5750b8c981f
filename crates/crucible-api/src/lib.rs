pub mod handlers;

use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crucible_core::config::ApiConfig;

pub use handlers::ApiState;

pub async fn serve(state: ApiState, config: &ApiConfig) -> anyhow::Result<()> {
    let cors = if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let mut shutdown = state.shutdown_tx.subscribe();

    let api_routes = Router::new()
        .route("/compile", post(handlers::handle_compile))
        .route("/deploy", post(handlers::handle_deploy))
        .route("/jobs", get(handlers::handle_list_jobs))
        .route("/jobs/{id}", get(handlers::handle_get_job))
        .route("/status", get(handlers::handle_status))
        .route("/ws", get(handlers::handle_ws))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
