use axum::Router;

pub mod sync;
pub mod system;

/// Router for the sync operations endpoints.
pub fn router() -> Router {
    Router::new().nest("/sync", sync::router())
}
