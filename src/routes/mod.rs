pub mod assets;
pub mod auth;
pub mod home;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::error::AppError;

/// The application's route table. Built once at startup and handed to the
/// server.
pub fn router() -> Router {
    Router::new()
        .route("/", get(home::index))
        .route("/index", get(home::index))
        .route("/login", get(auth::login))
        .route("/assets/{*path}", get(assets::serve))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
}

async fn not_found() -> AppError {
    AppError::NotFound
}
