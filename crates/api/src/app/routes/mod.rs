use axum::{Router, routing::{get, post}};

pub mod completions;
pub mod runs;
pub mod system;

/// Router for all run and completion endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/runs", runs::router())
        .route("/completions", post(completions::notify_completion))
        .route("/ready", get(system::ready))
}
