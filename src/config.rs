use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::DEFAULT_SESSION_TTL;

pub const DEFAULT_INFERENCE_URL: &str = "https://twob01-2239745-shawnlim-ca2-models.onrender.com";

const MIB: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub database_path: PathBuf,
    pub inference_url: String,
    pub inference_timeout: Duration,
    pub session_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5020,
            body_limit_bytes: 5 * MIB,
            database_path: PathBuf::from("./vegetables.db"),
            inference_url: DEFAULT_INFERENCE_URL.to_string(),
            inference_timeout: Duration::from_secs(30),
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }
}

impl Config {
    /// Reads the process environment, after loading `.env` if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from any variable source; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let body_limit_mb = parse_var::<_, usize>(&lookup, "BODY_LIMIT_MB", BODY_LIMIT)?;
        let body_limit_bytes = match body_limit_mb {
            Some(mb) => megabytes_to_bytes(mb)?,
            None => defaults.body_limit_bytes,
        };
        let port = parse_var(&lookup, "PORT", PORT_RANGE)?
            .unwrap_or(defaults.port);
        let inference_timeout = parse_var(&lookup, "INFERENCE_TIMEOUT_SECS", SECONDS)?
            .map(Duration::from_secs)
            .unwrap_or(defaults.inference_timeout);
        let session_ttl = parse_var(&lookup, "SESSION_TTL_SECS", SECONDS)?
            .map(Duration::from_secs)
            .unwrap_or(defaults.session_ttl);

        Ok(Self {
            port,
            body_limit_bytes,
            database_path: lookup("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            inference_url: lookup("INFERENCE_URL").unwrap_or(defaults.inference_url),
            inference_timeout,
            session_ttl,
        })
    }
}

const BODY_LIMIT: &str = "a whole number of megabytes";
const PORT_RANGE: &str = "a valid number between 0 and 65535";
const SECONDS: &str = "a number of seconds";

fn megabytes_to_bytes(mb: usize) -> Result<usize, ConfigError> {
    let overflow = || ConfigError::Invalid {
        name: "BODY_LIMIT_MB",
        expected: BODY_LIMIT,
        value: mb.to_string(),
    };
    mb.checked_mul(MIB).ok_or_else(overflow)
}

fn parse_var<F, T>(
    lookup: &F,
    name: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                name,
                expected,
                value,
            }),
    }
}
