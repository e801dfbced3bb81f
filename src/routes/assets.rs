use axum::extract::Path;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use rust_embed::Embed;

use crate::error::{AppError, AppResult};

const CACHE_CONTROL: &str = "public, max-age=86400";

/// Stylesheets and other static files compiled into the binary.
#[derive(Embed)]
#[folder = "assets/"]
struct Assets;

pub async fn serve(Path(path): Path<String>) -> AppResult<Response> {
    let file = Assets::get(&path).ok_or(AppError::NotFound)?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CACHE_CONTROL, CACHE_CONTROL.to_string()),
        ],
        file.data.into_owned(),
    )
        .into_response())
}
