//! Embedded in-process backend for the Database trait.
//!
//! Keeps everything in plain vectors behind one mutex. No durability;
//! intended for local development and the integration tests. Error texts
//! mirror the postgres backend where callers pattern-match on them
//! (duplicate-key detection in the auth layer).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::db::{
    AssignmentFields, AttachmentRecord, AttachmentStore, AttachmentWithUploader, CaseDetail,
    CaseRecord, CaseScope, CaseStore, CaseWithStatus, CreateAttachmentParams, CreateCaseParams,
    CreateMessageParams, CreateNoteParams, CreateUserParams, FeedbackRecord, FeedbackStore,
    InternalNoteRecord, MessageRecord, MessageStore, NoteStore, SessionRecord, SessionStore,
    StatusRecord, StatusStore, UpsertFeedbackParams, UserCredentials, UserRecord, UserRole,
    UserStore, UserSummary,
};
use crate::error::DatabaseError;

struct StoredUser {
    record: UserRecord,
    password_hash: String,
    confirmation_token_hash: Option<String>,
}

#[derive(Default)]
struct State {
    users: Vec<StoredUser>,
    sessions: HashMap<String, SessionRecord>,
    statuses: Vec<StatusRecord>,
    cases: Vec<CaseRecord>,
    messages: Vec<MessageRecord>,
    notes: Vec<InternalNoteRecord>,
    attachments: Vec<AttachmentRecord>,
    message_attachments: Vec<(Uuid, Uuid)>,
    feedback: Vec<FeedbackRecord>,
}

/// In-memory database backend.
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

const SEED_STATUSES: [(&str, &str, i32); 5] = [
    ("Intake", "New case awaiting triage", 1),
    ("Pre-litigation", "Investigation and demand phase", 2),
    ("Litigation", "Filed and in active litigation", 3),
    ("Settlement", "Settlement negotiation in progress", 4),
    ("Closed", "Matter resolved and closed", 5),
];

impl MemoryBackend {
    pub fn new() -> Self {
        let now = Utc::now();
        let statuses = SEED_STATUSES
            .iter()
            .map(|(name, description, order_index)| StatusRecord {
                id: Uuid::new_v4(),
                status_name: name.to_string(),
                description: Some(description.to_string()),
                order_index: *order_index,
                created_at: now,
                updated_at: now,
            })
            .collect();
        Self {
            state: Mutex::new(State {
                statuses,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock means a panic mid-mutation; propagating the inner
        // state is still the most useful thing for tests.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn uploader_summary(state: &State, uploader_id: Uuid) -> Result<UserSummary, DatabaseError> {
    state
        .users
        .iter()
        .find(|u| u.record.id == uploader_id)
        .map(|u| UserSummary::from(&u.record))
        .ok_or(DatabaseError::NotFound { entity: "user" })
}

#[async_trait]
impl UserStore for MemoryBackend {
    async fn create_user(&self, params: &CreateUserParams) -> Result<UserRecord, DatabaseError> {
        let mut state = self.lock();
        if state.users.iter().any(|u| u.record.email == params.email) {
            return Err(DatabaseError::Query(
                "duplicate key value violates unique constraint \"users_email_key\"".to_string(),
            ));
        }
        let now = Utc::now();
        let record = UserRecord {
            id: Uuid::new_v4(),
            email: params.email.clone(),
            full_name: params.full_name.clone(),
            role: params.role,
            email_confirmed_at: params.email_confirmed.then_some(now),
            created_at: now,
            updated_at: now,
        };
        state.users.push(StoredUser {
            record: record.clone(),
            password_hash: params.password_hash.clone(),
            confirmation_token_hash: params.confirmation_token_hash.clone(),
        });
        Ok(record)
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>, DatabaseError> {
        let state = self.lock();
        Ok(state
            .users
            .iter()
            .find(|u| u.record.id == id)
            .map(|u| u.record.clone()))
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserRecord>, DatabaseError> {
        let state = self.lock();
        Ok(state
            .users
            .iter()
            .find(|u| u.record.email == email)
            .map(|u| u.record.clone()))
    }

    async fn find_credentials_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserCredentials>, DatabaseError> {
        let state = self.lock();
        Ok(state
            .users
            .iter()
            .find(|u| u.record.email == email)
            .map(|u| UserCredentials {
                user: u.record.clone(),
                password_hash: u.password_hash.clone(),
            }))
    }

    async fn confirm_email(
        &self,
        token_hash: &str,
    ) -> Result<Option<UserRecord>, DatabaseError> {
        let mut state = self.lock();
        let user = state
            .users
            .iter_mut()
            .find(|u| u.confirmation_token_hash.as_deref() == Some(token_hash));
        match user {
            None => Ok(None),
            Some(user) => {
                let now = Utc::now();
                user.record.email_confirmed_at = Some(now);
                user.record.updated_at = now;
                user.confirmation_token_hash = None;
                Ok(Some(user.record.clone()))
            }
        }
    }

    async fn list_agents(&self) -> Result<Vec<UserRecord>, DatabaseError> {
        let state = self.lock();
        let mut agents: Vec<UserRecord> = state
            .users
            .iter()
            .filter(|u| u.record.role == UserRole::Agent)
            .map(|u| u.record.clone())
            .collect();
        agents.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(agents)
    }
}

#[async_trait]
impl SessionStore for MemoryBackend {
    async fn create_session(&self, session: &SessionRecord) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        state
            .sessions
            .insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    async fn find_session(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let state = self.lock();
        Ok(state.sessions.get(token_hash).cloned())
    }

    async fn delete_session(&self, token_hash: &str) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        state.sessions.remove(token_hash);
        Ok(())
    }

    async fn delete_expired_sessions(&self) -> Result<u64, DatabaseError> {
        let mut state = self.lock();
        let now = Utc::now();
        let before = state.sessions.len();
        state.sessions.retain(|_, s| s.expires_at >= now);
        Ok((before - state.sessions.len()) as u64)
    }
}

#[async_trait]
impl StatusStore for MemoryBackend {
    async fn list_statuses(&self) -> Result<Vec<StatusRecord>, DatabaseError> {
        let state = self.lock();
        let mut statuses = state.statuses.clone();
        statuses.sort_by_key(|s| s.order_index);
        Ok(statuses)
    }

    async fn find_status_by_id(&self, id: Uuid) -> Result<Option<StatusRecord>, DatabaseError> {
        let state = self.lock();
        Ok(state.statuses.iter().find(|s| s.id == id).cloned())
    }

    async fn find_status_by_name(
        &self,
        name: &str,
    ) -> Result<Option<StatusRecord>, DatabaseError> {
        let state = self.lock();
        Ok(state
            .statuses
            .iter()
            .find(|s| s.status_name == name)
            .cloned())
    }
}

#[async_trait]
impl CaseStore for MemoryBackend {
    async fn create_case(&self, params: &CreateCaseParams) -> Result<CaseRecord, DatabaseError> {
        let mut state = self.lock();
        let now = Utc::now();
        let record = CaseRecord {
            id: Uuid::new_v4(),
            client_id: params.client_id,
            assigned_agent_id: None,
            status_id: params.status_id,
            title: params.title.clone(),
            description: params.description.clone(),
            custom_fields: None,
            created_at: now,
            updated_at: now,
        };
        state.cases.push(record.clone());
        Ok(record)
    }

    async fn find_case_by_id(&self, id: Uuid) -> Result<Option<CaseRecord>, DatabaseError> {
        let state = self.lock();
        Ok(state.cases.iter().find(|c| c.id == id).cloned())
    }

    async fn get_case_detail(&self, id: Uuid) -> Result<Option<CaseDetail>, DatabaseError> {
        let state = self.lock();
        let Some(case) = state.cases.iter().find(|c| c.id == id).cloned() else {
            return Ok(None);
        };
        let client = state
            .users
            .iter()
            .find(|u| u.record.id == case.client_id)
            .map(|u| UserSummary::from(&u.record))
            .ok_or_else(|| {
                DatabaseError::Serialization(format!(
                    "case {id} references missing client {}",
                    case.client_id
                ))
            })?;
        let assigned_agent = match case.assigned_agent_id {
            None => None,
            Some(agent_id) => Some(
                state
                    .users
                    .iter()
                    .find(|u| u.record.id == agent_id)
                    .map(|u| UserSummary::from(&u.record))
                    .ok_or_else(|| {
                        DatabaseError::Serialization(format!(
                            "case {id} references missing agent {agent_id}"
                        ))
                    })?,
            ),
        };
        let status = state
            .statuses
            .iter()
            .find(|s| s.id == case.status_id)
            .cloned()
            .ok_or_else(|| {
                DatabaseError::Serialization(format!(
                    "case {id} references missing status {}",
                    case.status_id
                ))
            })?;
        Ok(Some(CaseDetail {
            case,
            client,
            assigned_agent,
            status,
        }))
    }

    async fn list_cases(&self, scope: CaseScope) -> Result<Vec<CaseWithStatus>, DatabaseError> {
        let state = self.lock();
        let mut cases: Vec<CaseRecord> = state
            .cases
            .iter()
            .filter(|c| match scope {
                CaseScope::Client(user_id) => c.client_id == user_id,
                CaseScope::Agent(user_id) => c.assigned_agent_id == Some(user_id),
                CaseScope::All => true,
            })
            .cloned()
            .collect();
        cases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        cases
            .into_iter()
            .map(|case| {
                let status_name = state
                    .statuses
                    .iter()
                    .find(|s| s.id == case.status_id)
                    .map(|s| s.status_name.clone())
                    .ok_or(DatabaseError::NotFound { entity: "status" })?;
                Ok(CaseWithStatus { case, status_name })
            })
            .collect()
    }

    async fn update_case_status(
        &self,
        id: Uuid,
        status_id: Uuid,
    ) -> Result<Option<CaseRecord>, DatabaseError> {
        let mut state = self.lock();
        let Some(case) = state.cases.iter_mut().find(|c| c.id == id) else {
            return Ok(None);
        };
        case.status_id = status_id;
        case.updated_at = Utc::now();
        Ok(Some(case.clone()))
    }

    async fn update_case_agent(
        &self,
        id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<Option<CaseRecord>, DatabaseError> {
        let mut state = self.lock();
        let Some(case) = state.cases.iter_mut().find(|c| c.id == id) else {
            return Ok(None);
        };
        case.assigned_agent_id = agent_id;
        case.updated_at = Utc::now();
        Ok(Some(case.clone()))
    }

    async fn apply_assignment(
        &self,
        id: Uuid,
        fields: &AssignmentFields,
    ) -> Result<Option<CaseRecord>, DatabaseError> {
        let mut state = self.lock();
        let Some(case) = state.cases.iter_mut().find(|c| c.id == id) else {
            return Ok(None);
        };
        case.assigned_agent_id = Some(fields.assigned_agent_id);
        case.custom_fields = Some(fields.merge_into(case.custom_fields.take()));
        case.updated_at = Utc::now();
        Ok(Some(case.clone()))
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn list_messages(&self, case_id: Uuid) -> Result<Vec<MessageRecord>, DatabaseError> {
        let state = self.lock();
        let mut messages: Vec<MessageRecord> = state
            .messages
            .iter()
            .filter(|m| m.case_id == case_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn find_message(&self, id: Uuid) -> Result<Option<MessageRecord>, DatabaseError> {
        let state = self.lock();
        Ok(state.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn create_message(
        &self,
        params: &CreateMessageParams,
    ) -> Result<MessageRecord, DatabaseError> {
        let mut state = self.lock();
        let now = Utc::now();
        let record = MessageRecord {
            id: Uuid::new_v4(),
            case_id: params.case_id,
            sender_id: params.sender_id,
            message_content: params.message_content.clone(),
            created_at: now,
            updated_at: now,
        };
        state.messages.push(record.clone());
        Ok(record)
    }
}

#[async_trait]
impl NoteStore for MemoryBackend {
    async fn list_notes(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<InternalNoteRecord>, DatabaseError> {
        let state = self.lock();
        let mut notes: Vec<InternalNoteRecord> = state
            .notes
            .iter()
            .filter(|n| n.case_id == case_id)
            .cloned()
            .collect();
        notes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(notes)
    }

    async fn create_note(
        &self,
        params: &CreateNoteParams,
    ) -> Result<InternalNoteRecord, DatabaseError> {
        let mut state = self.lock();
        let now = Utc::now();
        let record = InternalNoteRecord {
            id: Uuid::new_v4(),
            case_id: params.case_id,
            agent_id: params.agent_id,
            note_content: params.note_content.clone(),
            created_at: now,
            updated_at: now,
        };
        state.notes.push(record.clone());
        Ok(record)
    }
}

#[async_trait]
impl AttachmentStore for MemoryBackend {
    async fn create_attachment(
        &self,
        params: &CreateAttachmentParams,
    ) -> Result<AttachmentRecord, DatabaseError> {
        let mut state = self.lock();
        let now = Utc::now();
        let record = AttachmentRecord {
            id: Uuid::new_v4(),
            case_id: params.case_id,
            uploader_id: params.uploader_id,
            file_path: params.file_path.clone(),
            file_name: params.file_name.clone(),
            file_size: params.file_size,
            file_type: params.file_type.clone(),
            created_at: now,
            updated_at: now,
        };
        state.attachments.push(record.clone());
        Ok(record)
    }

    async fn find_attachment(
        &self,
        id: Uuid,
    ) -> Result<Option<AttachmentRecord>, DatabaseError> {
        let state = self.lock();
        Ok(state.attachments.iter().find(|a| a.id == id).cloned())
    }

    async fn list_attachments(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<AttachmentWithUploader>, DatabaseError> {
        let state = self.lock();
        let mut attachments: Vec<AttachmentRecord> = state
            .attachments
            .iter()
            .filter(|a| a.case_id == case_id)
            .cloned()
            .collect();
        attachments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        attachments
            .into_iter()
            .map(|attachment| {
                let uploader = uploader_summary(&state, attachment.uploader_id)?;
                Ok(AttachmentWithUploader {
                    attachment,
                    uploader,
                })
            })
            .collect()
    }

    async fn delete_attachment(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let mut state = self.lock();
        let before = state.attachments.len();
        state.attachments.retain(|a| a.id != id);
        state.message_attachments.retain(|(_, att)| *att != id);
        Ok(state.attachments.len() < before)
    }

    async fn link_message_attachment(
        &self,
        message_id: Uuid,
        attachment_id: Uuid,
    ) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        let link = (message_id, attachment_id);
        if !state.message_attachments.contains(&link) {
            state.message_attachments.push(link);
        }
        Ok(())
    }

    async fn list_message_attachments(
        &self,
        message_id: Uuid,
    ) -> Result<Vec<AttachmentWithUploader>, DatabaseError> {
        let state = self.lock();
        let mut attachments: Vec<AttachmentRecord> = state
            .message_attachments
            .iter()
            .filter(|(msg, _)| *msg == message_id)
            .filter_map(|(_, att)| state.attachments.iter().find(|a| a.id == *att).cloned())
            .collect();
        attachments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        attachments
            .into_iter()
            .map(|attachment| {
                let uploader = uploader_summary(&state, attachment.uploader_id)?;
                Ok(AttachmentWithUploader {
                    attachment,
                    uploader,
                })
            })
            .collect()
    }
}

#[async_trait]
impl FeedbackStore for MemoryBackend {
    async fn get_feedback(
        &self,
        case_id: Uuid,
    ) -> Result<Option<FeedbackRecord>, DatabaseError> {
        let state = self.lock();
        Ok(state.feedback.iter().find(|f| f.case_id == case_id).cloned())
    }

    async fn upsert_feedback(
        &self,
        params: &UpsertFeedbackParams,
    ) -> Result<FeedbackRecord, DatabaseError> {
        let mut state = self.lock();
        let now = Utc::now();
        if let Some(existing) = state
            .feedback
            .iter_mut()
            .find(|f| f.case_id == params.case_id)
        {
            existing.rating = params.rating;
            existing.comments = params.comments.clone();
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let record = FeedbackRecord {
            id: Uuid::new_v4(),
            case_id: params.case_id,
            client_id: params.client_id,
            rating: params.rating,
            comments: params.comments.clone(),
            created_at: now,
            updated_at: now,
        };
        state.feedback.push(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_email_surfaces_as_duplicate_key_error() {
        let backend = MemoryBackend::new();
        let params = CreateUserParams {
            email: "client@example.com".to_string(),
            full_name: "A Client".to_string(),
            role: UserRole::Client,
            password_hash: "hash".to_string(),
            confirmation_token_hash: None,
            email_confirmed: true,
        };
        backend.create_user(&params).await.unwrap();
        let err = backend.create_user(&params).await.unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[tokio::test]
    async fn statuses_are_seeded_in_order() {
        let backend = MemoryBackend::new();
        let statuses = backend.list_statuses().await.unwrap();
        let names: Vec<&str> = statuses.iter().map(|s| s.status_name.as_str()).collect();
        assert_eq!(
            names,
            ["Intake", "Pre-litigation", "Litigation", "Settlement", "Closed"]
        );
    }

    #[tokio::test]
    async fn feedback_upsert_is_keyed_by_case() {
        let backend = MemoryBackend::new();
        let case_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        let first = backend
            .upsert_feedback(&UpsertFeedbackParams {
                case_id,
                client_id,
                rating: 3,
                comments: None,
            })
            .await
            .unwrap();
        let second = backend
            .upsert_feedback(&UpsertFeedbackParams {
                case_id,
                client_id,
                rating: 5,
                comments: Some("resolved quickly".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.rating, 5);
        assert_eq!(
            backend.get_feedback(case_id).await.unwrap().unwrap().rating,
            5
        );
    }
}
