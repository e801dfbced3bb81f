use askama::Template;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::error::{AppError, AppResult};

// --- View structs ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub author: User,
    pub body: String,
}

impl User {
    fn named(username: &str) -> Self {
        Self {
            username: username.to_string(),
        }
    }
}

impl Post {
    fn by(author: &str, body: &str) -> Self {
        Self {
            author: User::named(author),
            body: body.to_string(),
        }
    }
}

// --- Templates ---

#[derive(Template)]
#[template(path = "pages/index.html")]
pub struct IndexTemplate {
    pub title: &'static str,
    pub user: User,
    pub posts: Vec<Post>,
}

/// Wrapper to render askama templates as axum responses
pub struct Html<T: Template>(pub T);

impl<T: Template> IntoResponse for Html<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                body,
            )
                .into_response(),
            Err(e) => AppError::from(e).into_response(),
        }
    }
}

/// Homepage context. The content is fixed; posts render in the order given.
pub fn index_context() -> IndexTemplate {
    IndexTemplate {
        title: "Home",
        user: User::named("Miguel"),
        posts: vec![
            Post::by("John", "Beautiful day in California!"),
            Post::by("Susan", "The Barbie movie was so cool!"),
            Post::by("Tony", "God, I love coffee!"),
        ],
    }
}

pub async fn index() -> AppResult<Html<IndexTemplate>> {
    Ok(Html(index_context()))
}
