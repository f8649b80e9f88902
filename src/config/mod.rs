//! Environment-driven configuration.
//!
//! Everything is read from process env vars (with `.env` support via
//! `dotenvy` in `main`). Each section has its own struct so call sites can
//! borrow just the part they need.

mod helpers;

use std::net::SocketAddr;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::ConfigError;
use helpers::{optional_env, parse_bool_env, parse_u64_env};

/// Which persistence backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Postgres,
    /// Embedded in-process store. No durability; intended for local
    /// development and tests.
    Memory,
}

impl DatabaseBackend {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::InvalidValue {
                key: "DB_BACKEND".to_string(),
                message: format!("unsupported backend '{other}'"),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// Connection string for the postgres backend.
    pub url: Option<SecretString>,
    pub pool_size: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Origins allowed for CORS. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for stored attachment objects.
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    /// Base URL of the external case-assignment service.
    pub service_url: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// When true, sign-up issues a confirmation token instead of a session.
    pub require_email_confirmation: bool,
    pub session_ttl_hours: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub ai: AiConfig,
    pub auth: AuthConfig,
}

pub const DEFAULT_AI_SERVICE_URL: &str = "http://localhost:8000";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_STORAGE_ROOT: &str = "data/attachments";
const DEFAULT_POOL_SIZE: usize = 8;
const DEFAULT_SESSION_TTL_HOURS: u64 = 24 * 7;

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_raw =
            optional_env("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr: SocketAddr =
            bind_raw
                .parse()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "BIND_ADDR".to_string(),
                    message: format!("'{bind_raw}' is not a socket address: {e}"),
                })?;

        let allowed_origins = optional_env("ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let database_url = optional_env("DATABASE_URL");
        let backend = match optional_env("DB_BACKEND") {
            Some(raw) => DatabaseBackend::from_str(&raw)?,
            // DATABASE_URL implies postgres; otherwise fall back to the
            // embedded store so a bare `caseline serve` works out of the box.
            None if database_url.is_some() => DatabaseBackend::Postgres,
            None => DatabaseBackend::Memory,
        };
        if backend == DatabaseBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing {
                key: "DATABASE_URL".to_string(),
            });
        }

        let pool_size = parse_u64_env("DB_POOL_SIZE", DEFAULT_POOL_SIZE as u64)? as usize;

        let storage_root = optional_env("STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));

        let service_url = optional_env("AI_SERVICE_URL")
            .unwrap_or_else(|| DEFAULT_AI_SERVICE_URL.to_string());
        let service_url = service_url.trim_end_matches('/').to_string();
        if service_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "AI_SERVICE_URL".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            server: ServerConfig {
                bind_addr,
                allowed_origins,
            },
            database: DatabaseConfig {
                backend,
                url: database_url.map(SecretString::from),
                pool_size,
            },
            storage: StorageConfig { root: storage_root },
            ai: AiConfig { service_url },
            auth: AuthConfig {
                require_email_confirmation: parse_bool_env(
                    "REQUIRE_EMAIL_CONFIRMATION",
                    false,
                )?,
                session_ttl_hours: parse_u64_env(
                    "SESSION_TTL_HOURS",
                    DEFAULT_SESSION_TTL_HOURS,
                )?,
            },
        })
    }
}
