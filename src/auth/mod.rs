//! Authentication: sign-up/sign-in/sign-out, bearer sessions, and the
//! per-request identity lookup.
//!
//! Passwords are hashed with argon2id. Session and confirmation tokens are
//! opaque random values; only their sha-256 digests are persisted.

mod cache;

pub use cache::IdentityCache;

use std::sync::Arc;
use std::time::Duration;

use argon2::password_hash::rand_core::OsRng as SaltRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::db::{
    CreateUserParams, Database, SessionRecord, UserRecord, UserRole, UserSummary,
};
use crate::error::AuthError;

/// Plaintext bearer token handed to the client, with its expiry.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a sign-up attempt.
#[derive(Debug)]
pub struct SignUpOutcome {
    pub user: UserRecord,
    /// Present when no confirmation step is configured.
    pub session: Option<IssuedSession>,
    pub requires_email_confirmation: bool,
    /// Plaintext confirmation token; the caller logs it in lieu of a mailer.
    pub confirmation_token: Option<String>,
}

/// Identity resolved from a bearer token, injected into request handlers.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub role: UserRole,
}

impl From<UserSummary> for AuthenticatedUser {
    fn from(summary: UserSummary) -> Self {
        Self {
            id: summary.id,
            email: summary.email,
            full_name: summary.full_name,
            role: summary.role,
        }
    }
}

fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut SaltRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

fn verify_password(candidate: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed)
        .is_ok()
}

/// 32 random bytes, base64url. Returns `(plaintext, sha256_hex)`.
fn generate_token() -> (String, String) {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let token = URL_SAFE_NO_PAD.encode(bytes);
    let hash = hash_token(&token);
    (token, hash)
}

pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

pub struct AuthService {
    db: Arc<dyn Database>,
    cache: IdentityCache,
    require_email_confirmation: bool,
    session_ttl: Duration,
}

impl AuthService {
    pub fn new(db: Arc<dyn Database>, config: &AuthConfig) -> Self {
        Self {
            db,
            cache: IdentityCache::new(cache::DEFAULT_TTL),
            require_email_confirmation: config.require_email_confirmation,
            session_ttl: Duration::from_secs(config.session_ttl_hours * 60 * 60),
        }
    }

    /// Register a new client account.
    ///
    /// When confirmation is required, no session is issued; the returned
    /// confirmation token must be presented to [`AuthService::confirm_email`]
    /// before sign-in succeeds.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<SignUpOutcome, AuthError> {
        let password_hash = hash_password(password)?;
        let (confirmation_token, confirmation_token_hash) = if self.require_email_confirmation {
            let (token, hash) = generate_token();
            (Some(token), Some(hash))
        } else {
            (None, None)
        };

        let params = CreateUserParams {
            email: email.trim().to_ascii_lowercase(),
            full_name: full_name.trim().to_string(),
            role: UserRole::Client,
            password_hash,
            confirmation_token_hash,
            email_confirmed: !self.require_email_confirmation,
        };

        let user = match self.db.create_user(&params).await {
            Ok(user) => user,
            // Backend unique-violation text contains "duplicate"; translate
            // it to the user-facing message instead of leaking SQL.
            Err(e) if e.to_string().contains("duplicate") => {
                return Err(AuthError::DuplicateEmail);
            }
            Err(e) => return Err(e.into()),
        };

        let session = if self.require_email_confirmation {
            None
        } else {
            Some(self.issue_session(&user).await?)
        };

        Ok(SignUpOutcome {
            requires_email_confirmation: self.require_email_confirmation,
            confirmation_token,
            session,
            user,
        })
    }

    /// Complete registration from a confirmation token.
    pub async fn confirm_email(&self, token: &str) -> Result<UserRecord, AuthError> {
        let user = self
            .db
            .confirm_email(&hash_token(token))
            .await?
            .ok_or(AuthError::InvalidConfirmationToken)?;
        self.cache.invalidate(user.id);
        Ok(user)
    }

    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(UserRecord, IssuedSession), AuthError> {
        let email = email.trim().to_ascii_lowercase();
        let credentials = self
            .db
            .find_credentials_by_email(&email)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(password, &credentials.password_hash) {
            return Err(AuthError::InvalidCredentials);
        }
        if credentials.user.email_confirmed_at.is_none() {
            return Err(AuthError::EmailNotConfirmed);
        }

        let session = self.issue_session(&credentials.user).await?;
        Ok((credentials.user, session))
    }

    pub async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        let token_hash = hash_token(token);
        if let Some(session) = self.db.find_session(&token_hash).await? {
            self.cache.invalidate(session.user_id);
        }
        self.db.delete_session(&token_hash).await?;
        Ok(())
    }

    /// Resolve a bearer token to an identity.
    ///
    /// Expired sessions are deleted on sight. Identity (including the role)
    /// comes from the cache when fresh, otherwise from the users table.
    pub async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let token_hash = hash_token(token);
        let session = self
            .db
            .find_session(&token_hash)
            .await?
            .ok_or(AuthError::SessionInvalid)?;

        // The store looked the hash up already; compare again in constant
        // time so a backend with lossy key comparison cannot widen a match.
        if !bool::from(session.token_hash.as_bytes().ct_eq(token_hash.as_bytes())) {
            return Err(AuthError::SessionInvalid);
        }
        if session.expires_at <= Utc::now() {
            self.db.delete_session(&token_hash).await?;
            return Err(AuthError::SessionInvalid);
        }

        if let Some(summary) = self.cache.get(session.user_id) {
            return Ok(summary.into());
        }

        let user = self
            .db
            .find_user_by_id(session.user_id)
            .await?
            .ok_or(AuthError::SessionInvalid)?;
        let summary = UserSummary::from(&user);
        self.cache.insert(summary.clone());
        Ok(summary.into())
    }

    /// Drop sessions past their expiry. Called opportunistically at startup.
    pub async fn purge_expired_sessions(&self) -> Result<u64, AuthError> {
        Ok(self.db.delete_expired_sessions().await?)
    }

    async fn issue_session(&self, user: &UserRecord) -> Result<IssuedSession, AuthError> {
        let (token, token_hash) = generate_token();
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.session_ttl)
                .unwrap_or(chrono::Duration::hours(24));
        self.db
            .create_session(&SessionRecord {
                token_hash,
                user_id: user.id,
                created_at: now,
                expires_at,
            })
            .await?;

        self.cache.insert(UserSummary::from(user));
        Ok(IssuedSession { token, expires_at })
    }
}
