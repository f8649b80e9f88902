//! Error taxonomy, one enum per concern.
//!
//! The gateway converts these into `(StatusCode, String)` at the HTTP
//! boundary; nothing here is fatal to the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database pool error: {0}")]
    Pool(String),

    #[error("Database query error: {0}")]
    Query(String),

    #[error("Database migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{entity} not found")]
    NotFound { entity: &'static str },
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for DatabaseError {
    fn from(err: tokio_postgres::Error) -> Self {
        DatabaseError::Query(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(err.to_string())
    }
}

/// Authentication and session failures.
///
/// The `Display` text of the credential variants is user-facing by design:
/// the gateway returns it verbatim instead of the backend's raw message.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("This email is already registered. Please sign in instead.")]
    DuplicateEmail,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Please confirm your email address before signing in")]
    EmailNotConfirmed,

    #[error("Invalid or expired confirmation token")]
    InvalidConfirmationToken,

    #[error("Session expired or not found")]
    SessionInvalid,

    #[error("Password hashing error: {0}")]
    Hash(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {path}")]
    NotFound { path: String },

    #[error("Storage I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid object path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Error)]
pub enum AssignError {
    #[error("AI service request failed: {0}")]
    Request(String),

    #[error("AI service error: {detail}")]
    Service { detail: String },

    #[error("Could not find agent with email {email}")]
    AgentNotFound { email: String },

    #[error("User {email} is not an agent")]
    NotAnAgent { email: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
