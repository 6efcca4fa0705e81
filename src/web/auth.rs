use anyhow::Context;
use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::Redirect,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{Duration as ChronoDuration, Utc};
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    google::{GoogleProfile, LoginAttempt},
    web::{ApiMessage, AppState, json_error},
};

pub const SESSION_COOKIE: &str = "session_id";
const OAUTH_STATE_COOKIE: &str = "oauth_state";
const OAUTH_VERIFIER_COOKIE: &str = "oauth_verifier";
const OAUTH_COOKIE_PATH: &str = "/auth/google";
const LOGIN_COOKIE_TTL_MINUTES: i64 = 10;

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl AuthUser {
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or("there")
    }
}

pub struct JsonAuthError {
    pub status: StatusCode,
    pub message: &'static str,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub async fn start_google_login(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), Redirect> {
    let attempt = LoginAttempt::generate();
    let url = state.oauth().authorize_url(&attempt).map_err(|err| {
        error!(?err, "failed to build google sign-in url");
        Redirect::to("/?error=signin_unavailable")
    })?;

    let secure = state.config().cookies_secure();
    let jar = jar
        .add(login_cookie(OAUTH_STATE_COOKIE, attempt.state, secure))
        .add(login_cookie(OAUTH_VERIFIER_COOKIE, attempt.verifier, secure));

    Ok((jar, Redirect::to(&url)))
}

pub async fn google_callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> (CookieJar, Redirect) {
    let expected_state = jar.get(OAUTH_STATE_COOKIE).map(|c| c.value().to_string());
    let verifier = jar
        .get(OAUTH_VERIFIER_COOKIE)
        .map(|c| c.value().to_string());
    let jar = jar
        .remove(removal_cookie(OAUTH_STATE_COOKIE, OAUTH_COOKIE_PATH))
        .remove(removal_cookie(OAUTH_VERIFIER_COOKIE, OAUTH_COOKIE_PATH));

    if let Some(reason) = query.error {
        warn!(%reason, "google sign-in was not completed");
        return (jar, Redirect::to("/?error=access_denied"));
    }

    let (Some(code), Some(returned_state), Some(verifier)) = (query.code, query.state, verifier)
    else {
        return (jar, Redirect::to("/?error=invalid_callback"));
    };

    if !state_matches(expected_state.as_deref(), &returned_state) {
        warn!("google sign-in state mismatch");
        return (jar, Redirect::to("/?error=state_mismatch"));
    }

    match complete_sign_in(&state, &code, &verifier).await {
        Ok(session_token) => {
            let cookie = session_cookie(
                session_token,
                state.config().session_ttl_days,
                state.config().cookies_secure(),
            );
            (jar.add(cookie), Redirect::to("/"))
        }
        Err(err) => {
            error!(?err, "google sign-in failed");
            (jar, Redirect::to("/?error=signin_failed"))
        }
    }
}

async fn complete_sign_in(state: &AppState, code: &str, verifier: &str) -> anyhow::Result<Uuid> {
    let tokens = state.oauth().exchange_code(code, verifier).await?;
    let profile = state.oauth().fetch_profile(&tokens.access_token).await?;
    let user_id = upsert_user(state.pool_ref(), &profile)
        .await
        .context("failed to upsert signed-in user")?;
    let session = create_session(state.pool_ref(), user_id, state.config().session_ttl_days)
        .await
        .context("failed to create session")?;
    info!(%user_id, "user signed in");
    Ok(session)
}

pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Redirect) {
    let mut jar = jar;

    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if let Ok(token) = Uuid::parse_str(cookie.value()) {
            if let Err(err) = sqlx::query("DELETE FROM sessions WHERE id = $1")
                .bind(token)
                .execute(state.pool_ref())
                .await
            {
                error!(?err, "failed to remove session during logout");
            }
        }
    }

    jar = jar.remove(removal_cookie(SESSION_COOKIE, "/"));

    (jar, Redirect::to("/?status=logged_out"))
}

pub async fn me(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Json<AuthUser>, (StatusCode, Json<ApiMessage>)> {
    let user = current_user_or_json_error(&state, &jar)
        .await
        .map_err(|JsonAuthError { status, message }| json_error(status, message))?;
    Ok(Json(user))
}

/// Resolve the session cookie to a user, if it names a live session.
pub async fn current_user(state: &AppState, jar: &CookieJar) -> sqlx::Result<Option<AuthUser>> {
    let Some(token) = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| Uuid::parse_str(cookie.value()).ok())
    else {
        return Ok(None);
    };
    fetch_user_by_session(state.pool_ref(), token).await
}

pub async fn current_user_or_json_error(
    state: &AppState,
    jar: &CookieJar,
) -> Result<AuthUser, JsonAuthError> {
    match current_user(state, jar).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(JsonAuthError {
            status: StatusCode::UNAUTHORIZED,
            message: "Please sign in first.",
        }),
        Err(err) => {
            error!(?err, "failed to resolve session");
            Err(JsonAuthError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "Could not verify your session.",
            })
        }
    }
}

pub async fn upsert_user(pool: &PgPool, profile: &GoogleProfile) -> sqlx::Result<Uuid> {
    sqlx::query_scalar(
        "INSERT INTO users (id, google_sub, email, display_name, avatar_url)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (google_sub) DO UPDATE
         SET email = EXCLUDED.email,
             display_name = EXCLUDED.display_name,
             avatar_url = EXCLUDED.avatar_url,
             last_login_at = NOW()
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(&profile.sub)
    .bind(&profile.email)
    .bind(&profile.name)
    .bind(&profile.picture)
    .fetch_one(pool)
    .await
}

pub async fn create_session(pool: &PgPool, user_id: Uuid, ttl_days: i64) -> sqlx::Result<Uuid> {
    let token = Uuid::new_v4();
    let expires_at = Utc::now() + ChronoDuration::days(ttl_days);
    sqlx::query("INSERT INTO sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
        .bind(token)
        .bind(user_id)
        .bind(expires_at)
        .execute(pool)
        .await?;
    Ok(token)
}

pub async fn fetch_user_by_session(pool: &PgPool, token: Uuid) -> sqlx::Result<Option<AuthUser>> {
    sqlx::query_as::<_, AuthUser>(
        "SELECT users.id, users.email, users.display_name, users.avatar_url
         FROM sessions JOIN users ON users.id = sessions.user_id
         WHERE sessions.id = $1 AND sessions.expires_at > NOW()",
    )
    .bind(token)
    .fetch_optional(pool)
    .await
}

pub async fn purge_expired_sessions(pool: &PgPool) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

fn session_cookie(token: Uuid, ttl_days: i64, secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, token.to_string());
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(CookieDuration::days(ttl_days));
    cookie
}

// Lax so the cookies survive the top-level redirect back from Google.
fn login_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);
    cookie.set_path(OAUTH_COOKIE_PATH);
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(CookieDuration::minutes(LOGIN_COOKIE_TTL_MINUTES));
    cookie
}

fn removal_cookie(name: &'static str, path: &'static str) -> Cookie<'static> {
    let mut removal = Cookie::new(name, "");
    removal.set_path(path);
    removal.set_http_only(true);
    removal.set_same_site(SameSite::Lax);
    removal.set_max_age(CookieDuration::seconds(0));
    removal
}

fn state_matches(expected: Option<&str>, returned: &str) -> bool {
    match expected {
        Some(expected) if !expected.is_empty() => {
            constant_time_eq(expected.as_bytes(), returned.as_bytes())
        }
        _ => false,
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_must_match_cookie() {
        assert!(state_matches(Some("abc123"), "abc123"));
        assert!(!state_matches(Some("abc123"), "abc124"));
        assert!(!state_matches(Some("abc123"), "abc"));
        assert!(!state_matches(None, "abc123"));
        assert!(!state_matches(Some(""), ""));
    }

    #[test]
    fn constant_time_eq_compares_contents() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokem"));
        assert!(!constant_time_eq(b"token", b"tokens"));
    }

    #[test]
    fn session_cookie_is_locked_down() {
        let token = Uuid::new_v4();
        let cookie = session_cookie(token, 7, true);
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.value(), token.to_string());
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.max_age(), Some(CookieDuration::days(7)));
    }

    #[test]
    fn login_cookies_are_short_lived_and_scoped() {
        let cookie = login_cookie(OAUTH_STATE_COOKIE, "state".to_string(), false);
        assert_eq!(cookie.path(), Some(OAUTH_COOKIE_PATH));
        assert_eq!(cookie.secure(), Some(false));
        assert_eq!(cookie.max_age(), Some(CookieDuration::minutes(10)));
    }

    #[tokio::test]
    async fn me_without_session_is_json_401() {
        let state = AppState::for_tests(std::sync::Arc::new(
            crate::storage::memory::MemoryStore::default(),
        ));
        let (status, Json(body)) = me(State(state), CookieJar::new()).await.unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.message, "Please sign in first.");
    }

    #[test]
    fn label_prefers_display_name_then_email() {
        let mut user = AuthUser {
            id: Uuid::new_v4(),
            email: Some("ada@example.com".into()),
            display_name: Some("Ada".into()),
            avatar_url: None,
        };
        assert_eq!(user.label(), "Ada");
        user.display_name = None;
        assert_eq!(user.label(), "ada@example.com");
        user.email = None;
        assert_eq!(user.label(), "there");
    }
}
