pub mod error;
pub mod extract;
pub mod orchestrator;
pub mod routes;
pub mod state;
pub mod vcs;
pub mod worker;

use axum::routing::{get, post};
use axum::Router;
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router for a project root.
/// Used by `serve()` and available for integration testing.
pub fn build_router(root: PathBuf) -> anyhow::Result<Router> {
    Ok(router(state::AppState::new(root)?))
}

/// All API routes and middleware over an existing state.
pub fn router(app_state: state::AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Events (SSE)
        .route("/api/events", get(routes::events::sse_events))
        // State
        .route("/api/state", get(routes::state::get_state))
        .route("/api/versions", get(routes::versions::list_versions))
        .route("/api/metrics", get(routes::metrics::get_metrics))
        // PRD
        .route(
            "/api/prd",
            get(routes::prd::get_prd)
                .post(routes::prd::import_prd)
                .put(routes::prd::update_stories),
        )
        .route("/api/prd/refine", post(routes::prd::refine))
        .route("/api/prd/refine/edit", post(routes::prd::refine_story))
        .route("/api/prd/generate", post(routes::prd::generate))
        .route(
            "/api/prd/align",
            post(routes::prd::align).put(routes::prd::apply_alignment),
        )
        .route("/api/story/{id}", get(routes::story::get_story))
        // Execution
        .route(
            "/api/run",
            get(routes::run::get_run).post(routes::run::post_run),
        )
        .route(
            "/api/signal",
            get(routes::signal::get_signal).post(routes::signal::post_signal),
        )
        .route(
            "/api/handoffs",
            get(routes::handoffs::get_handoffs).post(routes::handoffs::post_handoffs),
        )
        // Tasks
        .route(
            "/api/tasks",
            get(routes::tasks::list_tasks).post(routes::tasks::create_task),
        )
        .route("/api/tasks/read-all", post(routes::tasks::mark_all_read))
        .route(
            "/api/tasks/{id}",
            get(routes::tasks::get_task)
                .patch(routes::tasks::patch_task)
                .delete(routes::tasks::delete_task),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the Ralph API server.
pub async fn serve(root: PathBuf, port: u16, open_browser: bool) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(root, listener, open_browser).await
}

/// Start the Ralph API server on a pre-bound listener.
///
/// Unlike `serve`, this accepts a `TcpListener` that was already bound so the
/// caller can read the actual port before starting (useful when `port = 0` and
/// the OS picks a free port). The port is what agents are told to signal on.
pub async fn serve_on(
    root: PathBuf,
    listener: tokio::net::TcpListener,
    open_browser: bool,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = router(state::AppState::on_port(root, actual_port)?);

    tracing::info!("Ralph server listening on http://localhost:{actual_port}");

    if open_browser {
        let url = format!("http://localhost:{actual_port}/api/state");
        let _ = open::that(&url);
    }

    axum::serve(listener, app).await?;
    Ok(())
}
