//! Bearer-session middleware for the protected API routes.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::AuthError;
use crate::gateway::server::AppState;

/// Raw bearer token for the current request; sign-out needs it back.
#[derive(Debug, Clone)]
pub struct SessionToken(pub String);

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, String)> {
    let token = bearer_token(&request)
        .ok_or((
            StatusCode::UNAUTHORIZED,
            "Missing bearer token".to_string(),
        ))?
        .to_string();

    let user = state.auth.authenticate(&token).await.map_err(|e| match e {
        AuthError::SessionInvalid => (StatusCode::UNAUTHORIZED, e.to_string()),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    })?;

    request.extensions_mut().insert(user);
    request.extensions_mut().insert(SessionToken(token));
    Ok(next.run(request).await)
}
