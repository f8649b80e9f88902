//! Axum HTTP server for the case gateway.
//!
//! Handles all API routes: auth, cases, messages, internal notes,
//! attachments, feedback, and the per-case live feed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Extension, Json, Router,
};
use tokio::sync::{oneshot, RwLock};
use tower_http::cors::{AllowHeaders, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::assign::{run_assignment, AssignClient};
use crate::auth::{AuthService, AuthenticatedUser};
use crate::db::{
    CaseRecord, CaseScope, CreateCaseParams, CreateMessageParams, CreateNoteParams, Database,
    UpsertFeedbackParams, UserRole, UserSummary,
};
use crate::error::{AssignError, AuthError, DatabaseError};
use crate::gateway::auth::{auth_middleware, SessionToken};
use crate::gateway::sse::{self, CaseBroadcast, FeedHub};
use crate::gateway::types::*;
use crate::gateway::upload::{
    attachment_delete_handler, attachment_download_handler, attachment_upload_handler,
    attachments_list_handler, message_attachments_list_handler, UPLOAD_BODY_LIMIT,
};
use crate::storage::ObjectStorage;

/// Status every new case starts in; seeded by migration.
pub const INTAKE_STATUS: &str = "Intake";
/// Status that opens the feedback window for the client.
pub const CLOSED_STATUS: &str = "Closed";

/// Shared state for all gateway handlers.
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub auth: AuthService,
    pub storage: Arc<dyn ObjectStorage>,
    pub assign: AssignClient,
    pub feed: FeedHub,
    /// Shutdown signal sender.
    pub shutdown_tx: RwLock<Option<oneshot::Sender<()>>>,
}

/// Start the gateway HTTP server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    allowed_origins: &[String],
) -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let public = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/auth/signup", post(signup_handler))
        .route("/api/auth/confirm", post(confirm_email_handler))
        .route("/api/auth/login", post(login_handler));

    let protected = Router::new()
        // Auth
        .route("/api/auth/logout", post(logout_handler))
        .route("/api/auth/session", get(session_handler))
        // Lookups
        .route("/api/statuses", get(statuses_list_handler))
        .route("/api/users/agents", get(agents_list_handler))
        // Cases
        .route(
            "/api/cases",
            get(cases_list_handler).post(cases_create_handler),
        )
        .route("/api/cases/{id}", get(case_detail_handler))
        .route("/api/cases/{id}/status", put(case_status_update_handler))
        .route("/api/cases/{id}/agent", put(case_agent_update_handler))
        .route("/api/cases/{id}/assign", post(case_auto_assign_handler))
        // Per-case records
        .route(
            "/api/cases/{id}/messages",
            get(messages_list_handler).post(message_create_handler),
        )
        .route(
            "/api/cases/{id}/notes",
            get(notes_list_handler).post(note_create_handler),
        )
        .route(
            "/api/cases/{id}/feedback",
            get(feedback_get_handler).put(feedback_upsert_handler),
        )
        .route("/api/cases/{id}/events", get(case_events_handler))
        // Attachments
        .route(
            "/api/cases/{id}/attachments",
            get(attachments_list_handler)
                .post(attachment_upload_handler)
                .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route(
            "/api/messages/{id}/attachments",
            get(message_attachments_list_handler),
        )
        .route(
            "/api/attachments/{id}/download",
            get(attachment_download_handler),
        )
        .route(
            "/api/attachments/{id}",
            axum::routing::delete(attachment_delete_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // CORS: configured origins plus the local bind, since the SPA is
    // usually served from a dev server on another port.
    let mut origins: Vec<header::HeaderValue> = Vec::new();
    for raw in allowed_origins
        .iter()
        .cloned()
        .chain([format!("http://localhost:{}", bound_addr.port())])
    {
        match raw.parse() {
            Ok(origin) => origins.push(origin),
            Err(e) => tracing::warn!("Ignoring unparsable CORS origin '{}': {}", raw, e),
        }
    }
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ]))
        .allow_credentials(true);

    let app = Router::new()
        .merge(public)
        .merge(protected)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB default request cap
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("DENY"),
        ))
        .with_state(state.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Case gateway shutting down");
            })
            .await
        {
            tracing::error!("Case gateway server error: {}", e);
        }
    });

    Ok(bound_addr)
}

// --- Error mapping ---

pub fn db_error(e: DatabaseError) -> (StatusCode, String) {
    match &e {
        DatabaseError::Serialization(_) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        DatabaseError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn auth_error(e: AuthError) -> (StatusCode, String) {
    let status = match e {
        AuthError::DuplicateEmail => StatusCode::CONFLICT,
        AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        AuthError::EmailNotConfirmed => StatusCode::FORBIDDEN,
        AuthError::InvalidConfirmationToken => StatusCode::BAD_REQUEST,
        AuthError::SessionInvalid => StatusCode::UNAUTHORIZED,
        AuthError::Hash(_) | AuthError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn assign_error(e: AssignError) -> (StatusCode, String) {
    match e {
        AssignError::Request(_) | AssignError::Service { .. } => {
            (StatusCode::BAD_GATEWAY, e.to_string())
        }
        AssignError::AgentNotFound { .. } | AssignError::NotAnAgent { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
        AssignError::Database(db) => db_error(db),
    }
}

// --- Access control ---

/// A case is visible to its client, its assigned agent, and admins.
pub fn ensure_case_access(
    user: &AuthenticatedUser,
    case: &CaseRecord,
) -> Result<(), (StatusCode, String)> {
    let allowed = match user.role {
        UserRole::Admin => true,
        UserRole::Agent => case.assigned_agent_id == Some(user.id),
        UserRole::Client => case.client_id == user.id,
    };
    if allowed {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            "You do not have access to this case".to_string(),
        ))
    }
}

fn ensure_staff(user: &AuthenticatedUser) -> Result<(), (StatusCode, String)> {
    if user.role.is_staff() {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            "Agent or admin role required".to_string(),
        ))
    }
}

pub async fn load_case(
    state: &AppState,
    id: Uuid,
) -> Result<CaseRecord, (StatusCode, String)> {
    state
        .db
        .find_case_by_id(id)
        .await
        .map_err(db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Case not found".to_string()))
}

fn required_field(name: &str, value: &str) -> Result<String, (StatusCode, String)> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("'{name}' is required"),
        ));
    }
    Ok(trimmed.to_string())
}

// --- Health ---

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "caseline",
    })
}

// --- Auth handlers ---

async fn signup_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignUpRequest>,
) -> Result<(StatusCode, Json<SignUpResponse>), (StatusCode, String)> {
    let email = required_field("email", &req.email)?;
    if !email.contains('@') {
        return Err((
            StatusCode::BAD_REQUEST,
            "A valid email address is required".to_string(),
        ));
    }
    if req.password.len() < 8 {
        return Err((
            StatusCode::BAD_REQUEST,
            "Password must be at least 8 characters".to_string(),
        ));
    }
    let full_name = required_field("full_name", &req.full_name)?;

    let outcome = state
        .auth
        .sign_up(&email, &req.password, &full_name)
        .await
        .map_err(auth_error)?;

    if let Some(token) = &outcome.confirmation_token {
        // No mailer is wired up; the operator relays the token from logs.
        tracing::info!(
            email = %outcome.user.email,
            confirmation_token = %token,
            "Email confirmation required for new account"
        );
    }

    Ok((
        StatusCode::CREATED,
        Json(SignUpResponse {
            user: UserSummary::from(&outcome.user),
            session: outcome.session.map(|s| SessionInfo {
                token: s.token,
                expires_at: s.expires_at,
            }),
            requires_email_confirmation: outcome.requires_email_confirmation,
        }),
    ))
}

async fn confirm_email_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConfirmEmailRequest>,
) -> Result<Json<ActionResponse>, (StatusCode, String)> {
    let user = state
        .auth
        .confirm_email(req.token.trim())
        .await
        .map_err(auth_error)?;
    Ok(Json(ActionResponse::ok(format!(
        "Email {} confirmed. You can now sign in.",
        user.email
    ))))
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, String)> {
    let (user, session) = state
        .auth
        .sign_in(&req.email, &req.password)
        .await
        .map_err(auth_error)?;
    Ok(Json(LoginResponse {
        user: UserSummary::from(&user),
        token: session.token,
        expires_at: session.expires_at,
    }))
}

async fn logout_handler(
    State(state): State<Arc<AppState>>,
    Extension(token): Extension<SessionToken>,
) -> Result<Json<ActionResponse>, (StatusCode, String)> {
    state.auth.sign_out(&token.0).await.map_err(auth_error)?;
    Ok(Json(ActionResponse::ok("Signed out")))
}

async fn session_handler(
    Extension(user): Extension<AuthenticatedUser>,
) -> Json<SessionResponse> {
    Json(SessionResponse {
        user: UserSummary {
            id: user.id,
            email: user.email,
            full_name: user.full_name,
            role: user.role,
        },
    })
}

// --- Lookup handlers ---

async fn statuses_list_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusListResponse>, (StatusCode, String)> {
    let statuses = state.db.list_statuses().await.map_err(db_error)?;
    Ok(Json(StatusListResponse { statuses }))
}

async fn agents_list_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<AgentListResponse>, (StatusCode, String)> {
    ensure_staff(&user)?;
    let agents = state.db.list_agents().await.map_err(db_error)?;
    Ok(Json(AgentListResponse {
        agents: agents.iter().map(UserSummary::from).collect(),
    }))
}

// --- Case handlers ---

async fn cases_list_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<CaseListResponse>, (StatusCode, String)> {
    let scope = match user.role {
        UserRole::Client => CaseScope::Client(user.id),
        UserRole::Agent => CaseScope::Agent(user.id),
        UserRole::Admin => CaseScope::All,
    };
    let cases = state.db.list_cases(scope).await.map_err(db_error)?;
    Ok(Json(CaseListResponse { cases }))
}

async fn cases_create_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<CreateCaseRequest>,
) -> Result<(StatusCode, Json<CreateCaseResponse>), (StatusCode, String)> {
    if user.role != UserRole::Client {
        return Err((
            StatusCode::FORBIDDEN,
            "Only clients can submit cases".to_string(),
        ));
    }
    let title = required_field("title", &req.title)?;
    let description = required_field("description", &req.description)?;

    let intake = state
        .db
        .find_status_by_name(INTAKE_STATUS)
        .await
        .map_err(db_error)?
        .ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Status table is not seeded".to_string(),
        ))?;

    let case = state
        .db
        .create_case(&CreateCaseParams {
            client_id: user.id,
            status_id: intake.id,
            title,
            description: Some(description),
        })
        .await
        .map_err(db_error)?;

    // Best-effort AI triage; a failure leaves the case standing, unassigned.
    let (case, assignment_error) =
        match run_assignment(&state.assign, &state.db, &case).await {
            Ok(updated) => (updated, None),
            Err(e) => {
                tracing::warn!(case_id = %case.id, "AI assignment failed: {}", e);
                (case, Some(e.to_string()))
            }
        };

    Ok((
        StatusCode::CREATED,
        Json(CreateCaseResponse {
            case,
            assignment_error,
        }),
    ))
}

async fn case_detail_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<CaseDetailResponse>, (StatusCode, String)> {
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;

    let detail = state
        .db
        .get_case_detail(id)
        .await
        .map_err(db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Case not found".to_string()))?;
    Ok(Json(CaseDetailResponse { detail }))
}

async fn case_status_update_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateCaseStatusRequest>,
) -> Result<Json<CaseResponse>, (StatusCode, String)> {
    ensure_staff(&user)?;
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;

    state
        .db
        .find_status_by_id(req.status_id)
        .await
        .map_err(db_error)?
        .ok_or((
            StatusCode::UNPROCESSABLE_ENTITY,
            "Unknown status".to_string(),
        ))?;

    let case = state
        .db
        .update_case_status(id, req.status_id)
        .await
        .map_err(db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Case not found".to_string()))?;
    Ok(Json(CaseResponse { case }))
}

async fn case_agent_update_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateCaseAgentRequest>,
) -> Result<Json<CaseResponse>, (StatusCode, String)> {
    if user.role != UserRole::Admin {
        return Err((
            StatusCode::FORBIDDEN,
            "Admin role required".to_string(),
        ));
    }
    load_case(&state, id).await?;

    if let Some(agent_id) = req.agent_id {
        let agent = state
            .db
            .find_user_by_id(agent_id)
            .await
            .map_err(db_error)?
            .ok_or((
                StatusCode::UNPROCESSABLE_ENTITY,
                "Unknown agent".to_string(),
            ))?;
        if !agent.role.is_staff() {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("User {} is not an agent", agent.email),
            ));
        }
    }

    let case = state
        .db
        .update_case_agent(id, req.agent_id)
        .await
        .map_err(db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Case not found".to_string()))?;
    Ok(Json(CaseResponse { case }))
}

async fn case_auto_assign_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<CaseResponse>, (StatusCode, String)> {
    ensure_staff(&user)?;
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;

    let case = run_assignment(&state.assign, &state.db, &case)
        .await
        .map_err(assign_error)?;
    Ok(Json(CaseResponse { case }))
}

// --- Message handlers ---

async fn messages_list_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageListResponse>, (StatusCode, String)> {
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;

    let messages = state.db.list_messages(id).await.map_err(db_error)?;
    Ok(Json(MessageListResponse { messages }))
}

async fn message_create_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), (StatusCode, String)> {
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;
    let content = required_field("content", &req.content)?;

    let message = state
        .db
        .create_message(&CreateMessageParams {
            case_id: id,
            sender_id: user.id,
            message_content: content,
        })
        .await
        .map_err(db_error)?;

    state.feed.publish(CaseBroadcast {
        case_id: id,
        author_id: user.id,
        event: CaseEvent::Message {
            message: message.clone(),
        },
    });

    Ok((StatusCode::CREATED, Json(MessageResponse { message })))
}

// --- Internal note handlers ---

async fn notes_list_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<NoteListResponse>, (StatusCode, String)> {
    ensure_staff(&user)?;
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;

    let notes = state.db.list_notes(id).await.map_err(db_error)?;
    Ok(Json(NoteListResponse { notes }))
}

async fn note_create_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateNoteRequest>,
) -> Result<(StatusCode, Json<NoteResponse>), (StatusCode, String)> {
    ensure_staff(&user)?;
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;
    let content = required_field("content", &req.content)?;

    let note = state
        .db
        .create_note(&CreateNoteParams {
            case_id: id,
            agent_id: user.id,
            note_content: content,
        })
        .await
        .map_err(db_error)?;

    state.feed.publish(CaseBroadcast {
        case_id: id,
        author_id: user.id,
        event: CaseEvent::InternalNote { note: note.clone() },
    });

    Ok((StatusCode::CREATED, Json(NoteResponse { note })))
}

// --- Feedback handlers ---

async fn feedback_get_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<FeedbackResponse>, (StatusCode, String)> {
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;

    let feedback = state.db.get_feedback(id).await.map_err(db_error)?;
    Ok(Json(FeedbackResponse { feedback }))
}

async fn feedback_upsert_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpsertFeedbackRequest>,
) -> Result<Json<FeedbackResponse>, (StatusCode, String)> {
    if user.role != UserRole::Client {
        return Err((
            StatusCode::FORBIDDEN,
            "Only the case's client can leave feedback".to_string(),
        ));
    }
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;
    if !(1..=5).contains(&req.rating) {
        return Err((
            StatusCode::BAD_REQUEST,
            "Rating must be between 1 and 5".to_string(),
        ));
    }

    let status = state
        .db
        .find_status_by_id(case.status_id)
        .await
        .map_err(db_error)?
        .ok_or((
            StatusCode::UNPROCESSABLE_ENTITY,
            "Case is missing status information".to_string(),
        ))?;
    if status.status_name != CLOSED_STATUS {
        return Err((
            StatusCode::CONFLICT,
            "Feedback can be submitted once the case is closed".to_string(),
        ));
    }

    let feedback = state
        .db
        .upsert_feedback(&UpsertFeedbackParams {
            case_id: id,
            client_id: user.id,
            rating: req.rating,
            comments: req.comments.and_then(|c| {
                let trimmed = c.trim().to_string();
                (!trimmed.is_empty()).then_some(trimmed)
            }),
        })
        .await
        .map_err(db_error)?;
    Ok(Json(FeedbackResponse {
        feedback: Some(feedback),
    }))
}

// --- Live feed handler ---

async fn case_events_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;

    let stream = sse::case_feed(state.db.clone(), &state.feed, id, user)
        .await
        .map_err(db_error)?;
    Ok((
        [("X-Accel-Buffering", "no"), ("Cache-Control", "no-cache")],
        stream,
    ))
}
