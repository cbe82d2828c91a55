//! Password hashing and cookie sessions.

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::http::{header, HeaderMap};
use uuid::Uuid;

use crate::store::AccountId;

pub const SESSION_COOKIE: &str = "session";
const COOKIE_ATTRIBUTES: &str = "Path=/; HttpOnly; SameSite=Lax";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("could not hash password: {0}")]
    Hash(String),
}

/// Salted Argon2 hash in PHC string format.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

/// Constant-time check of `password` against a stored PHC string. A hash
/// that cannot be parsed never verifies.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Checks a sign-in attempt. Without an account the password is verified
/// against a dummy hash and rejected, so both paths cost one Argon2 run.
pub fn verify_account_password(password: &str, stored_hash: Option<&str>) -> bool {
    match stored_hash {
        Some(hash) => verify_password(password, hash),
        None => {
            verify_password(password, dummy_hash());
            false
        }
    }
}

fn dummy_hash() -> &'static str {
    static DUMMY: OnceLock<String> = OnceLock::new();
    DUMMY.get_or_init(hash_dummy)
}

fn hash_dummy() -> String {
    hash_password("no such account").unwrap_or_default()
}

#[derive(Debug, Clone, Copy)]
struct Session {
    account_id: AccountId,
    created: Instant,
}

impl Session {
    fn is_live(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.created) < ttl
    }
}

/// In-memory table of live session tokens. Tokens older than the TTL are
/// rejected on lookup and pruned whenever a new session is created.
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }
}

impl SessionStore {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn create(&self, account_id: AccountId) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let created = Instant::now();
        let ttl = self.ttl;
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|_, session| session.is_live(created, ttl));
        sessions.insert(
            token.clone(),
            Session {
                account_id,
                created,
            },
        );
        token
    }

    pub fn lookup(&self, token: &str) -> Option<AccountId> {
        let session = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .copied()?;
        if session.is_live(Instant::now(), self.ttl) {
            Some(session.account_id)
        } else {
            self.remove(token);
            None
        }
    }

    pub fn remove(&self, token: &str) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    /// Ends every session of `account_id`.
    pub fn remove_account(&self, account_id: AccountId) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, session| session.account_id != account_id);
    }
}

pub fn session_cookie(token: &str, ttl: Duration) -> String {
    format!(
        "{SESSION_COOKIE}={token}; {COOKIE_ATTRIBUTES}; Max-Age={}",
        ttl.as_secs()
    )
}

pub fn expired_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; {COOKIE_ATTRIBUTES}; Max-Age=0")
}

pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
