use askama::Template;

use crate::error::AppResult;
use crate::routes::home::Html;

// --- Forms ---

/// Sign-in form as presented to the template. Only the form shell is
/// described here; credentials and their validation are not handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginForm {
    pub action: &'static str,
    pub method: &'static str,
    pub submit_label: &'static str,
}

impl Default for LoginForm {
    fn default() -> Self {
        Self {
            action: "/login",
            method: "post",
            submit_label: "Sign In",
        }
    }
}

#[derive(Template)]
#[template(path = "pages/login.html")]
pub struct LoginTemplate {
    pub title: &'static str,
    pub form: LoginForm,
}

pub fn login_context() -> LoginTemplate {
    LoginTemplate {
        title: "Sign In",
        form: LoginForm::default(),
    }
}

pub async fn login() -> AppResult<Html<LoginTemplate>> {
    Ok(Html(login_context()))
}
