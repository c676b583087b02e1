//! hive-api — operator HTTP API served by the master.

pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/workers", get(handlers::handle_workers))
        .route(
            "/tasks",
            get(handlers::handle_tasks)
                .post(handlers::handle_submit)
                .delete(handlers::handle_purge),
        )
        .route("/tasks/{id}", get(handlers::handle_task))
        .route("/tasks/{id}/cancel", post(handlers::handle_cancel))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serve the API on an already bound listener until the server fails.
pub async fn serve(state: ApiState, listener: TcpListener) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
