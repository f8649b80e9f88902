//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait that unifies all persistence
//! operations. Two implementations exist:
//!
//! - `postgres` (default feature): deadpool-postgres + tokio-postgres, with
//!   refinery migrations
//! - `memory`: an embedded in-process store for local development and tests
//!
//! Each sub-trait groups one entity's persistence methods; the `Database`
//! supertrait combines them so consumers hold a single `Arc<dyn Database>`.

#[cfg(feature = "postgres")]
pub mod postgres;

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::DatabaseError;

/// Create a database backend from configuration, run migrations, and return
/// it. The shared helper for `main` and the CLI subcommands.
pub async fn connect_from_config(
    config: &DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        DatabaseBackend::Memory => Ok(Arc::new(memory::MemoryBackend::new())),
        #[cfg(feature = "postgres")]
        DatabaseBackend::Postgres => {
            let pg = postgres::PgBackend::new(config)
                .await
                .map_err(|e| DatabaseError::Pool(e.to_string()))?;
            pg.run_migrations().await?;
            Ok(Arc::new(pg))
        }
        #[cfg(not(feature = "postgres"))]
        DatabaseBackend::Postgres => Err(DatabaseError::Pool(
            "postgres backend not compiled in. Enable the 'postgres' feature.".to_string(),
        )),
    }
}

/// Access role. Gates visibility of internal notes and administrative
/// actions; authoritative in the users table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Client,
    Agent,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Agent => "agent",
            Self::Admin => "admin",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "client" => Some(Self::Client),
            "agent" => Some(Self::Agent),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Agents and admins share the staff-side view (internal notes, status
    /// and assignment changes).
    pub fn is_staff(self) -> bool {
        matches!(self, Self::Agent | Self::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub role: UserRole,
    pub email_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User row plus the stored password hash. Never serialized.
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user: UserRecord,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct CreateUserParams {
    pub email: String,
    pub full_name: String,
    pub role: UserRole,
    pub password_hash: String,
    /// Set when sign-up requires email confirmation; sha-256 of the token.
    pub confirmation_token_hash: Option<String>,
    /// Confirmed immediately when no confirmation step is configured.
    pub email_confirmed: bool,
}

/// Slim user projection embedded in joined responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub role: UserRole,
}

impl From<&UserRecord> for UserSummary {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            role: user.role,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub token_hash: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: Uuid,
    pub status_name: String,
    pub description: Option<String>,
    pub order_index: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: Uuid,
    pub client_id: Uuid,
    pub assigned_agent_id: Option<Uuid>,
    pub status_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub custom_fields: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateCaseParams {
    pub client_id: Uuid,
    pub status_id: Uuid,
    pub title: String,
    pub description: Option<String>,
}

/// Case row plus its status name, as shown on dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseWithStatus {
    #[serde(flatten)]
    pub case: CaseRecord,
    pub status_name: String,
}

/// Fully joined case view for the detail endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDetail {
    #[serde(flatten)]
    pub case: CaseRecord,
    pub client: UserSummary,
    pub assigned_agent: Option<UserSummary>,
    pub status: StatusRecord,
}

/// Role-derived visibility scope for case listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseScope {
    /// Cases the user submitted.
    Client(Uuid),
    /// Cases assigned to the agent.
    Agent(Uuid),
    /// Everything; admin only.
    All,
}

/// Assignment written back onto a case by the AI triage flow.
#[derive(Debug, Clone)]
pub struct AssignmentFields {
    pub assigned_agent_id: Uuid,
    pub explanation: String,
    pub confidence_score: f64,
    pub tags: Vec<String>,
}

impl AssignmentFields {
    /// Merge the assignment keys into an existing `custom_fields` map,
    /// preserving unrelated keys.
    pub fn merge_into(&self, custom_fields: Option<serde_json::Value>) -> serde_json::Value {
        let mut map = match custom_fields {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        map.insert(
            "ai_assignment_explanation".to_string(),
            serde_json::Value::String(self.explanation.clone()),
        );
        map.insert(
            "ai_confidence_score".to_string(),
            serde_json::json!(self.confidence_score),
        );
        map.insert("case_tags".to_string(), serde_json::json!(self.tags));
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub sender_id: Uuid,
    pub message_content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateMessageParams {
    pub case_id: Uuid,
    pub sender_id: Uuid,
    pub message_content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalNoteRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub agent_id: Uuid,
    pub note_content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateNoteParams {
    pub case_id: Uuid,
    pub agent_id: Uuid,
    pub note_content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub uploader_id: Uuid,
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateAttachmentParams {
    pub case_id: Uuid,
    pub uploader_id: Uuid,
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
}

/// Attachment row joined with its uploader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentWithUploader {
    #[serde(flatten)]
    pub attachment: AttachmentRecord,
    pub uploader: UserSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub client_id: Uuid,
    pub rating: i32,
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpsertFeedbackParams {
    pub case_id: Uuid,
    pub client_id: Uuid,
    pub rating: i32,
    pub comments: Option<String>,
}

// ==================== Sub-traits ====================
//
// Each sub-trait groups one entity's persistence methods. The `Database`
// supertrait combines them all, so consumers keep a single handle while
// leaf code can depend on a specific sub-trait.

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a user. A duplicate email surfaces as a query error whose
    /// message contains `duplicate`; the auth layer maps it to a friendly
    /// error.
    async fn create_user(&self, params: &CreateUserParams) -> Result<UserRecord, DatabaseError>;
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>, DatabaseError>;
    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserRecord>, DatabaseError>;
    async fn find_credentials_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserCredentials>, DatabaseError>;
    /// Confirm the email matching this token hash, clearing the token.
    /// Returns the confirmed user, or `None` when no user matches.
    async fn confirm_email(
        &self,
        token_hash: &str,
    ) -> Result<Option<UserRecord>, DatabaseError>;
    async fn list_agents(&self) -> Result<Vec<UserRecord>, DatabaseError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &SessionRecord) -> Result<(), DatabaseError>;
    async fn find_session(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError>;
    async fn delete_session(&self, token_hash: &str) -> Result<(), DatabaseError>;
    async fn delete_expired_sessions(&self) -> Result<u64, DatabaseError>;
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// All statuses ordered by `order_index` ascending.
    async fn list_statuses(&self) -> Result<Vec<StatusRecord>, DatabaseError>;
    async fn find_status_by_id(&self, id: Uuid) -> Result<Option<StatusRecord>, DatabaseError>;
    async fn find_status_by_name(
        &self,
        name: &str,
    ) -> Result<Option<StatusRecord>, DatabaseError>;
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn create_case(&self, params: &CreateCaseParams) -> Result<CaseRecord, DatabaseError>;
    async fn find_case_by_id(&self, id: Uuid) -> Result<Option<CaseRecord>, DatabaseError>;
    /// Joined detail view; `None` when the case does not exist. A case whose
    /// joins cannot be resolved is a serialization error, not `None`.
    async fn get_case_detail(&self, id: Uuid) -> Result<Option<CaseDetail>, DatabaseError>;
    /// Cases visible under the scope, newest first, with status names.
    async fn list_cases(&self, scope: CaseScope) -> Result<Vec<CaseWithStatus>, DatabaseError>;
    async fn update_case_status(
        &self,
        id: Uuid,
        status_id: Uuid,
    ) -> Result<Option<CaseRecord>, DatabaseError>;
    async fn update_case_agent(
        &self,
        id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<Option<CaseRecord>, DatabaseError>;
    /// Write an AI assignment onto the case, merging `custom_fields`.
    async fn apply_assignment(
        &self,
        id: Uuid,
        fields: &AssignmentFields,
    ) -> Result<Option<CaseRecord>, DatabaseError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// All messages for a case, creation time ascending.
    async fn list_messages(&self, case_id: Uuid) -> Result<Vec<MessageRecord>, DatabaseError>;
    async fn find_message(&self, id: Uuid) -> Result<Option<MessageRecord>, DatabaseError>;
    async fn create_message(
        &self,
        params: &CreateMessageParams,
    ) -> Result<MessageRecord, DatabaseError>;
}

#[async_trait]
pub trait NoteStore: Send + Sync {
    /// All internal notes for a case, creation time ascending.
    async fn list_notes(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<InternalNoteRecord>, DatabaseError>;
    async fn create_note(
        &self,
        params: &CreateNoteParams,
    ) -> Result<InternalNoteRecord, DatabaseError>;
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn create_attachment(
        &self,
        params: &CreateAttachmentParams,
    ) -> Result<AttachmentRecord, DatabaseError>;
    async fn find_attachment(
        &self,
        id: Uuid,
    ) -> Result<Option<AttachmentRecord>, DatabaseError>;
    /// Attachments for a case with uploader info, newest first.
    async fn list_attachments(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<AttachmentWithUploader>, DatabaseError>;
    /// Delete the metadata row; join rows cascade. Returns whether a row
    /// existed.
    async fn delete_attachment(&self, id: Uuid) -> Result<bool, DatabaseError>;
    async fn link_message_attachment(
        &self,
        message_id: Uuid,
        attachment_id: Uuid,
    ) -> Result<(), DatabaseError>;
    async fn list_message_attachments(
        &self,
        message_id: Uuid,
    ) -> Result<Vec<AttachmentWithUploader>, DatabaseError>;
}

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn get_feedback(
        &self,
        case_id: Uuid,
    ) -> Result<Option<FeedbackRecord>, DatabaseError>;
    /// Insert or replace the one feedback row for a case.
    async fn upsert_feedback(
        &self,
        params: &UpsertFeedbackParams,
    ) -> Result<FeedbackRecord, DatabaseError>;
}

/// Unified persistence handle.
pub trait Database:
    UserStore
    + SessionStore
    + StatusStore
    + CaseStore
    + MessageStore
    + NoteStore
    + AttachmentStore
    + FeedbackStore
    + Send
    + Sync
{
}

impl<T> Database for T where
    T: UserStore
        + SessionStore
        + StatusStore
        + CaseStore
        + MessageStore
        + NoteStore
        + AttachmentStore
        + FeedbackStore
        + Send
        + Sync
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_db_values() {
        for role in [UserRole::Client, UserRole::Agent, UserRole::Admin] {
            assert_eq!(UserRole::from_db_value(role.as_str()), Some(role));
        }
        assert_eq!(UserRole::from_db_value("superuser"), None);
    }

    #[test]
    fn staff_check_excludes_clients() {
        assert!(UserRole::Agent.is_staff());
        assert!(UserRole::Admin.is_staff());
        assert!(!UserRole::Client.is_staff());
    }

    #[test]
    fn assignment_merge_preserves_existing_keys() {
        let fields = AssignmentFields {
            assigned_agent_id: Uuid::new_v4(),
            explanation: "prior experience with vehicle claims".to_string(),
            confidence_score: 0.87,
            tags: vec!["personal-injury".to_string(), "vehicle".to_string()],
        };
        let existing = serde_json::json!({ "intake_channel": "web" });
        let merged = fields.merge_into(Some(existing));

        assert_eq!(merged["intake_channel"], "web");
        assert_eq!(
            merged["ai_assignment_explanation"],
            "prior experience with vehicle claims"
        );
        assert_eq!(merged["ai_confidence_score"], 0.87);
        assert_eq!(merged["case_tags"][1], "vehicle");
    }

    #[test]
    fn assignment_merge_handles_non_object_fields() {
        let fields = AssignmentFields {
            assigned_agent_id: Uuid::new_v4(),
            explanation: "x".to_string(),
            confidence_score: 0.5,
            tags: vec![],
        };
        let merged = fields.merge_into(Some(serde_json::Value::String("junk".to_string())));
        assert!(merged.get("ai_confidence_score").is_some());
    }
}
