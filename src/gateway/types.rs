//! Request and response DTOs for the gateway API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{
    AttachmentRecord, AttachmentWithUploader, CaseDetail, CaseRecord, CaseWithStatus,
    FeedbackRecord, InternalNoteRecord, MessageRecord, StatusRecord, UserSummary,
};

// --- Health ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

// --- Auth ---

#[derive(Debug, Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub full_name: String,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SignUpResponse {
    pub user: UserSummary,
    /// Absent when email confirmation is required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    pub requires_email_confirmation: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmEmailRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: UserSummary,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub user: UserSummary,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

// --- Statuses / users ---

#[derive(Debug, Serialize)]
pub struct StatusListResponse {
    pub statuses: Vec<StatusRecord>,
}

#[derive(Debug, Serialize)]
pub struct AgentListResponse {
    pub agents: Vec<UserSummary>,
}

// --- Cases ---

#[derive(Debug, Deserialize)]
pub struct CreateCaseRequest {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct CreateCaseResponse {
    pub case: CaseRecord,
    /// Set when the AI assignment flow failed; the case stands, unassigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CaseListResponse {
    pub cases: Vec<CaseWithStatus>,
}

#[derive(Debug, Serialize)]
pub struct CaseDetailResponse {
    #[serde(flatten)]
    pub detail: CaseDetail,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCaseStatusRequest {
    pub status_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCaseAgentRequest {
    /// `null` clears the assignment.
    pub agent_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct CaseResponse {
    pub case: CaseRecord,
}

// --- Messages / notes ---

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct MessageListResponse {
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: MessageRecord,
}

#[derive(Debug, Deserialize)]
pub struct CreateNoteRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct NoteListResponse {
    pub notes: Vec<InternalNoteRecord>,
}

#[derive(Debug, Serialize)]
pub struct NoteResponse {
    pub note: InternalNoteRecord,
}

// --- Attachments ---

#[derive(Debug, Serialize)]
pub struct AttachmentListResponse {
    pub attachments: Vec<AttachmentWithUploader>,
}

#[derive(Debug, Serialize)]
pub struct AttachmentResponse {
    pub attachment: AttachmentRecord,
}

// --- Feedback ---

#[derive(Debug, Deserialize)]
pub struct UpsertFeedbackRequest {
    pub rating: i32,
    pub comments: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackRecord>,
}

// --- Live feed events ---

/// Payload of one event on a case's SSE feed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum CaseEvent {
    #[serde(rename = "message")]
    Message { message: MessageRecord },
    #[serde(rename = "internal_note")]
    InternalNote { note: InternalNoteRecord },
    #[serde(rename = "attachment")]
    Attachment { attachment: AttachmentRecord },
    /// Raised for subscribers other than the author of an insert.
    #[serde(rename = "notification")]
    Notification {
        kind: &'static str,
        description: &'static str,
    },
}

impl CaseEvent {
    /// SSE event name for the browser-side listener.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::InternalNote { .. } => "internal_note",
            Self::Attachment { .. } => "attachment",
            Self::Notification { .. } => "notification",
        }
    }
}
