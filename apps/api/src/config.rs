use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Apply the bundled schema migrations at startup.
    pub run_migrations: bool,
    /// Without Redis, resumable streams are kept in process memory.
    pub redis_url: Option<String>,
    pub backend_url: String,
    pub backend_api_key: Option<String>,
    pub backend_temperature: f32,
    pub backend_max_tokens: u32,
    pub backend_timeout: Duration,
    pub stream_ttl: Duration,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            database_max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
            run_migrations: parse_env("RUN_MIGRATIONS", true)?,
            redis_url: optional_env("REDIS_URL"),
            backend_url: require_env("BACKEND_URL")?,
            backend_api_key: optional_env("BACKEND_API_KEY"),
            backend_temperature: parse_env("BACKEND_TEMPERATURE", 0.7)?,
            backend_max_tokens: parse_env("BACKEND_MAX_TOKENS", 4096)?,
            backend_timeout: Duration::from_secs(parse_env("BACKEND_TIMEOUT_SECS", 300)?),
            stream_ttl: Duration::from_secs(parse_env("STREAM_TTL_SECS", 86_400)?),
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        None => Ok(default),
    }
}
