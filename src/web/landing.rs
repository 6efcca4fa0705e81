use axum::{
    extract::{Query, State},
    response::Html,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use tracing::error;

use crate::web::{AppState, auth, render_dashboard_page, render_login_page};

#[derive(Default, Deserialize)]
pub struct LandingQuery {
    pub status: Option<String>,
    pub error: Option<String>,
}

pub async fn landing_page(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<LandingQuery>,
) -> Html<String> {
    let maybe_user = match auth::current_user(&state, &jar).await {
        Ok(user) => user,
        Err(err) => {
            error!(?err, "failed to resolve session for landing page");
            None
        }
    };

    let flash = compose_landing_flash(&params);
    match maybe_user {
        Some(user) => Html(render_dashboard_page(
            user.label(),
            user.avatar_url.as_deref(),
            &flash,
        )),
        None => Html(render_login_page(&flash)),
    }
}

fn compose_landing_flash(params: &LandingQuery) -> String {
    if params.status.as_deref() == Some("logged_out") {
        return r#"<div class="flash success">You have been signed out.</div>"#.to_string();
    }

    if let Some(error) = params.error.as_deref() {
        let message = match error {
            "access_denied" => "Google sign-in was cancelled.",
            "state_mismatch" | "invalid_callback" => {
                "That sign-in link is no longer valid. Please try again."
            }
            "signin_unavailable" => "Sign-in is temporarily unavailable.",
            _ => "Sign-in failed. Please try again.",
        };
        return format!(r#"<div class="flash error">{message}</div>"#);
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_reflects_query() {
        let logged_out = LandingQuery {
            status: Some("logged_out".into()),
            error: None,
        };
        assert!(compose_landing_flash(&logged_out).contains("signed out"));

        let denied = LandingQuery {
            status: None,
            error: Some("access_denied".into()),
        };
        assert!(compose_landing_flash(&denied).contains("cancelled"));

        let unknown = LandingQuery {
            status: None,
            error: Some("<script>".into()),
        };
        let html = compose_landing_flash(&unknown);
        assert!(html.contains("Sign-in failed") && !html.contains("<script>"));

        assert!(compose_landing_flash(&LandingQuery::default()).is_empty());
    }
}
