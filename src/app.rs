use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts},
    http::request::Parts,
    routing::{get, post},
    Router,
};
use tokio::sync::Mutex;

use crate::auth::{token_from_headers, SessionStore};
use crate::error::AppError;
use crate::model::Predictor;
use crate::routes;
use crate::store::{AccountId, Store};

pub struct AppState {
    pub store: Mutex<Store>,
    pub predictor: Arc<dyn Predictor>,
    pub sessions: SessionStore,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(store: Store, predictor: Arc<dyn Predictor>) -> SharedState {
        Self::with_sessions(store, predictor, SessionStore::default())
    }

    pub fn with_session_ttl(
        store: Store,
        predictor: Arc<dyn Predictor>,
        session_ttl: Duration,
    ) -> SharedState {
        Self::with_sessions(store, predictor, SessionStore::with_ttl(session_ttl))
    }

    fn with_sessions(
        store: Store,
        predictor: Arc<dyn Predictor>,
        sessions: SessionStore,
    ) -> SharedState {
        Arc::new(Self {
            store: Mutex::new(store),
            predictor,
            sessions,
        })
    }
}

/// The account behind the request's session cookie. Rejects with 401.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: AccountId,
    pub token: String,
}

#[async_trait]
impl FromRequestParts<SharedState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let unauthorized = || AppError::Unauthorized;
        let token = token_from_headers(&parts.headers).ok_or_else(unauthorized)?;
        let id = state.sessions.lookup(&token).ok_or_else(unauthorized)?;
        Ok(Self { id, token })
    }
}

/// Like [`CurrentUser`] but anonymous requests pass through.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<CurrentUser>);

#[async_trait]
impl FromRequestParts<SharedState> for MaybeUser {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await.ok();
        Ok(Self(user))
    }
}

pub fn router(state: SharedState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/", get(routes::home))
        .route("/index", get(routes::home))
        .route("/home", get(routes::home))
        .route("/signup", get(routes::signup_page).post(routes::signup))
        .route("/signin", get(routes::signin_page).post(routes::signin))
        .route("/signout", get(routes::signout))
        .route("/setting", get(routes::setting))
        .route("/changeEmail", post(routes::change_email))
        .route("/changePassword", post(routes::change_password))
        .route("/delete_user", post(routes::delete_user))
        .route("/search", get(routes::search_page).post(routes::search))
        .route("/history/:id", get(routes::history))
        .route("/history/:id/image", get(routes::history_image))
        .route("/delete_history/:id", post(routes::delete_history))
        .route("/predict", post(routes::predict))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
        .route("/health", get(routes::health_check))
        .fallback(routes::not_found)
}
