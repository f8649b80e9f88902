//! PostgreSQL backend for the Database trait.
//!
//! All SQL is runtime-checked through tokio-postgres; refinery owns the
//! schema via the embedded `migrations/` directory.

use std::ops::DerefMut;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use secrecy::ExposeSecret;
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{
    AssignmentFields, AttachmentRecord, AttachmentStore, AttachmentWithUploader, CaseDetail,
    CaseRecord, CaseScope, CaseStore, CaseWithStatus, CreateAttachmentParams, CreateCaseParams,
    CreateMessageParams, CreateNoteParams, CreateUserParams, FeedbackRecord, FeedbackStore,
    InternalNoteRecord, MessageRecord, MessageStore, NoteStore, SessionRecord, SessionStore,
    StatusRecord, StatusStore, UpsertFeedbackParams, UserCredentials, UserRecord, UserRole,
    UserStore, UserSummary,
};
use crate::error::DatabaseError;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// PostgreSQL database backend over a deadpool connection pool.
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| DatabaseError::Pool("DATABASE_URL not configured".to_string()))?;
        let pg_config: tokio_postgres::Config = url
            .expose_secret()
            .parse()
            .map_err(|e| DatabaseError::Pool(format!("invalid DATABASE_URL: {e}")))?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Apply pending refinery migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.pool.get().await?;
        let client = conn.deref_mut().deref_mut();
        embedded::migrations::runner()
            .run_async(client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }
}

fn parse_role(raw: &str) -> Result<UserRole, DatabaseError> {
    UserRole::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid user role '{raw}'")))
}

fn row_to_user_record(row: &tokio_postgres::Row) -> Result<UserRecord, DatabaseError> {
    let role_raw: String = row.get("role");
    Ok(UserRecord {
        id: row.get("id"),
        email: row.get("email"),
        full_name: row.get("full_name"),
        role: parse_role(&role_raw)?,
        email_confirmed_at: row.get("email_confirmed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_status_record(row: &tokio_postgres::Row) -> StatusRecord {
    StatusRecord {
        id: row.get("id"),
        status_name: row.get("status_name"),
        description: row.get("description"),
        order_index: row.get("order_index"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_case_record(row: &tokio_postgres::Row) -> CaseRecord {
    CaseRecord {
        id: row.get("id"),
        client_id: row.get("client_id"),
        assigned_agent_id: row.get("assigned_agent_id"),
        status_id: row.get("status_id"),
        title: row.get("title"),
        description: row.get("description"),
        custom_fields: row.get("custom_fields"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_message_record(row: &tokio_postgres::Row) -> MessageRecord {
    MessageRecord {
        id: row.get("id"),
        case_id: row.get("case_id"),
        sender_id: row.get("sender_id"),
        message_content: row.get("message_content"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_note_record(row: &tokio_postgres::Row) -> InternalNoteRecord {
    InternalNoteRecord {
        id: row.get("id"),
        case_id: row.get("case_id"),
        agent_id: row.get("agent_id"),
        note_content: row.get("note_content"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_attachment_record(row: &tokio_postgres::Row) -> AttachmentRecord {
    AttachmentRecord {
        id: row.get("id"),
        case_id: row.get("case_id"),
        uploader_id: row.get("uploader_id"),
        file_path: row.get("file_path"),
        file_name: row.get("file_name"),
        file_size: row.get("file_size"),
        file_type: row.get("file_type"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_attachment_with_uploader(
    row: &tokio_postgres::Row,
) -> Result<AttachmentWithUploader, DatabaseError> {
    let role_raw: String = row.get("uploader_role");
    Ok(AttachmentWithUploader {
        attachment: row_to_attachment_record(row),
        uploader: UserSummary {
            id: row.get("uploader_id"),
            email: row.get("uploader_email"),
            full_name: row.get("uploader_full_name"),
            role: parse_role(&role_raw)?,
        },
    })
}

fn row_to_feedback_record(row: &tokio_postgres::Row) -> FeedbackRecord {
    FeedbackRecord {
        id: row.get("id"),
        case_id: row.get("case_id"),
        client_id: row.get("client_id"),
        rating: row.get("rating"),
        comments: row.get("comments"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const ATTACHMENT_WITH_UPLOADER_COLUMNS: &str = "a.id, a.case_id, a.uploader_id, a.file_path, \
     a.file_name, a.file_size, a.file_type, a.created_at, a.updated_at, \
     u.email AS uploader_email, u.full_name AS uploader_full_name, u.role AS uploader_role";

#[async_trait]
impl UserStore for PgBackend {
    async fn create_user(&self, params: &CreateUserParams) -> Result<UserRecord, DatabaseError> {
        let conn = self.pool.get().await?;
        let confirmed_at = if params.email_confirmed {
            Some(Utc::now())
        } else {
            None
        };
        let row = conn
            .query_one(
                "INSERT INTO users (id, email, full_name, role, password_hash, \
                 email_confirmed_at, confirmation_token_hash) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 RETURNING id, email, full_name, role, email_confirmed_at, created_at, updated_at",
                &[
                    &Uuid::new_v4(),
                    &params.email,
                    &params.full_name,
                    &params.role.as_str(),
                    &params.password_hash,
                    &confirmed_at,
                    &params.confirmation_token_hash,
                ],
            )
            .await?;
        row_to_user_record(&row)
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT id, email, full_name, role, email_confirmed_at, created_at, updated_at \
                 FROM users WHERE id = $1",
                &[&id],
            )
            .await?;
        row.as_ref().map(row_to_user_record).transpose()
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT id, email, full_name, role, email_confirmed_at, created_at, updated_at \
                 FROM users WHERE email = $1",
                &[&email],
            )
            .await?;
        row.as_ref().map(row_to_user_record).transpose()
    }

    async fn find_credentials_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserCredentials>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT id, email, full_name, role, email_confirmed_at, created_at, \
                 updated_at, password_hash FROM users WHERE email = $1",
                &[&email],
            )
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(UserCredentials {
                user: row_to_user_record(&row)?,
                password_hash: row.get("password_hash"),
            })),
        }
    }

    async fn confirm_email(
        &self,
        token_hash: &str,
    ) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "UPDATE users \
                 SET email_confirmed_at = NOW(), confirmation_token_hash = NULL, \
                     updated_at = NOW() \
                 WHERE confirmation_token_hash = $1 \
                 RETURNING id, email, full_name, role, email_confirmed_at, created_at, updated_at",
                &[&token_hash],
            )
            .await?;
        row.as_ref().map(row_to_user_record).transpose()
    }

    async fn list_agents(&self) -> Result<Vec<UserRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, email, full_name, role, email_confirmed_at, created_at, updated_at \
                 FROM users WHERE role = 'agent' ORDER BY email",
                &[],
            )
            .await?;
        rows.iter().map(row_to_user_record).collect()
    }
}

#[async_trait]
impl SessionStore for PgBackend {
    async fn create_session(&self, session: &SessionRecord) -> Result<(), DatabaseError> {
        let conn = self.pool.get().await?;
        conn.execute(
            "INSERT INTO sessions (token_hash, user_id, created_at, expires_at) \
             VALUES ($1, $2, $3, $4)",
            &[
                &session.token_hash,
                &session.user_id,
                &session.created_at,
                &session.expires_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn find_session(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT token_hash, user_id, created_at, expires_at \
                 FROM sessions WHERE token_hash = $1",
                &[&token_hash],
            )
            .await?;
        Ok(row.map(|row| SessionRecord {
            token_hash: row.get("token_hash"),
            user_id: row.get("user_id"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn delete_session(&self, token_hash: &str) -> Result<(), DatabaseError> {
        let conn = self.pool.get().await?;
        conn.execute("DELETE FROM sessions WHERE token_hash = $1", &[&token_hash])
            .await?;
        Ok(())
    }

    async fn delete_expired_sessions(&self) -> Result<u64, DatabaseError> {
        let conn = self.pool.get().await?;
        let count = conn
            .execute("DELETE FROM sessions WHERE expires_at < NOW()", &[])
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl StatusStore for PgBackend {
    async fn list_statuses(&self) -> Result<Vec<StatusRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, status_name, description, order_index, created_at, updated_at \
                 FROM statuses ORDER BY order_index",
                &[],
            )
            .await?;
        Ok(rows.iter().map(row_to_status_record).collect())
    }

    async fn find_status_by_id(&self, id: Uuid) -> Result<Option<StatusRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT id, status_name, description, order_index, created_at, updated_at \
                 FROM statuses WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_status_record))
    }

    async fn find_status_by_name(
        &self,
        name: &str,
    ) -> Result<Option<StatusRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT id, status_name, description, order_index, created_at, updated_at \
                 FROM statuses WHERE status_name = $1",
                &[&name],
            )
            .await?;
        Ok(row.as_ref().map(row_to_status_record))
    }
}

#[async_trait]
impl CaseStore for PgBackend {
    async fn create_case(&self, params: &CreateCaseParams) -> Result<CaseRecord, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "INSERT INTO cases (id, client_id, status_id, title, description) \
                 VALUES ($1, $2, $3, $4, $5) \
                 RETURNING id, client_id, assigned_agent_id, status_id, title, description, \
                           custom_fields, created_at, updated_at",
                &[
                    &Uuid::new_v4(),
                    &params.client_id,
                    &params.status_id,
                    &params.title,
                    &params.description,
                ],
            )
            .await?;
        Ok(row_to_case_record(&row))
    }

    async fn find_case_by_id(&self, id: Uuid) -> Result<Option<CaseRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT id, client_id, assigned_agent_id, status_id, title, description, \
                        custom_fields, created_at, updated_at \
                 FROM cases WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_case_record))
    }

    async fn get_case_detail(&self, id: Uuid) -> Result<Option<CaseDetail>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT c.id, c.client_id, c.assigned_agent_id, c.status_id, c.title, \
                        c.description, c.custom_fields, c.created_at, c.updated_at, \
                        cl.email AS client_email, cl.full_name AS client_full_name, \
                        cl.role AS client_role, \
                        ag.email AS agent_email, ag.full_name AS agent_full_name, \
                        ag.role AS agent_role, \
                        s.status_name, s.description AS status_description, s.order_index, \
                        s.created_at AS status_created_at, s.updated_at AS status_updated_at \
                 FROM cases c \
                 JOIN users cl ON cl.id = c.client_id \
                 LEFT JOIN users ag ON ag.id = c.assigned_agent_id \
                 JOIN statuses s ON s.id = c.status_id \
                 WHERE c.id = $1",
                &[&id],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let case = row_to_case_record(&row);
        let client_role: String = row.get("client_role");
        let client = UserSummary {
            id: case.client_id,
            email: row.get("client_email"),
            full_name: row.get("client_full_name"),
            role: parse_role(&client_role)?,
        };
        let assigned_agent = match case.assigned_agent_id {
            None => None,
            Some(agent_id) => {
                let email: Option<String> = row.get("agent_email");
                let full_name: Option<String> = row.get("agent_full_name");
                let role_raw: Option<String> = row.get("agent_role");
                match (email, full_name, role_raw) {
                    (Some(email), Some(full_name), Some(role_raw)) => Some(UserSummary {
                        id: agent_id,
                        email,
                        full_name,
                        role: parse_role(&role_raw)?,
                    }),
                    // Assigned agent id points at no user row; surface it
                    // rather than silently showing the case as unassigned.
                    _ => {
                        return Err(DatabaseError::Serialization(format!(
                            "case {id} references missing agent {agent_id}"
                        )));
                    }
                }
            }
        };
        let status = StatusRecord {
            id: case.status_id,
            status_name: row.get("status_name"),
            description: row.get("status_description"),
            order_index: row.get("order_index"),
            created_at: row.get("status_created_at"),
            updated_at: row.get("status_updated_at"),
        };

        Ok(Some(CaseDetail {
            case,
            client,
            assigned_agent,
            status,
        }))
    }

    async fn list_cases(&self, scope: CaseScope) -> Result<Vec<CaseWithStatus>, DatabaseError> {
        let conn = self.pool.get().await?;
        let base = "SELECT c.id, c.client_id, c.assigned_agent_id, c.status_id, c.title, \
                           c.description, c.custom_fields, c.created_at, c.updated_at, \
                           s.status_name \
                    FROM cases c JOIN statuses s ON s.id = c.status_id";
        let rows = match scope {
            CaseScope::Client(user_id) => {
                conn.query(
                    &format!("{base} WHERE c.client_id = $1 ORDER BY c.created_at DESC"),
                    &[&user_id],
                )
                .await?
            }
            CaseScope::Agent(user_id) => {
                conn.query(
                    &format!("{base} WHERE c.assigned_agent_id = $1 ORDER BY c.created_at DESC"),
                    &[&user_id],
                )
                .await?
            }
            CaseScope::All => {
                conn.query(&format!("{base} ORDER BY c.created_at DESC"), &[])
                    .await?
            }
        };
        Ok(rows
            .iter()
            .map(|row| CaseWithStatus {
                case: row_to_case_record(row),
                status_name: row.get("status_name"),
            })
            .collect())
    }

    async fn update_case_status(
        &self,
        id: Uuid,
        status_id: Uuid,
    ) -> Result<Option<CaseRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "UPDATE cases SET status_id = $2, updated_at = NOW() WHERE id = $1 \
                 RETURNING id, client_id, assigned_agent_id, status_id, title, description, \
                           custom_fields, created_at, updated_at",
                &[&id, &status_id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_case_record))
    }

    async fn update_case_agent(
        &self,
        id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<Option<CaseRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "UPDATE cases SET assigned_agent_id = $2, updated_at = NOW() WHERE id = $1 \
                 RETURNING id, client_id, assigned_agent_id, status_id, title, description, \
                           custom_fields, created_at, updated_at",
                &[&id, &agent_id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_case_record))
    }

    async fn apply_assignment(
        &self,
        id: Uuid,
        fields: &AssignmentFields,
    ) -> Result<Option<CaseRecord>, DatabaseError> {
        // Read-merge-write; the backend remains the single writer of record
        // and assignment is idempotent per trace, so no transaction here.
        let Some(current) = self.find_case_by_id(id).await? else {
            return Ok(None);
        };
        let merged = fields.merge_into(current.custom_fields);

        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "UPDATE cases SET assigned_agent_id = $2, custom_fields = $3, \
                        updated_at = NOW() \
                 WHERE id = $1 \
                 RETURNING id, client_id, assigned_agent_id, status_id, title, description, \
                           custom_fields, created_at, updated_at",
                &[&id, &fields.assigned_agent_id, &merged],
            )
            .await?;
        Ok(row.as_ref().map(row_to_case_record))
    }
}

#[async_trait]
impl MessageStore for PgBackend {
    async fn list_messages(&self, case_id: Uuid) -> Result<Vec<MessageRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, case_id, sender_id, message_content, created_at, updated_at \
                 FROM messages WHERE case_id = $1 ORDER BY created_at ASC",
                &[&case_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_message_record).collect())
    }

    async fn find_message(&self, id: Uuid) -> Result<Option<MessageRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT id, case_id, sender_id, message_content, created_at, updated_at \
                 FROM messages WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_message_record))
    }

    async fn create_message(
        &self,
        params: &CreateMessageParams,
    ) -> Result<MessageRecord, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "INSERT INTO messages (id, case_id, sender_id, message_content) \
                 VALUES ($1, $2, $3, $4) \
                 RETURNING id, case_id, sender_id, message_content, created_at, updated_at",
                &[
                    &Uuid::new_v4(),
                    &params.case_id,
                    &params.sender_id,
                    &params.message_content,
                ],
            )
            .await?;
        Ok(row_to_message_record(&row))
    }
}

#[async_trait]
impl NoteStore for PgBackend {
    async fn list_notes(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<InternalNoteRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, case_id, agent_id, note_content, created_at, updated_at \
                 FROM internal_notes WHERE case_id = $1 ORDER BY created_at ASC",
                &[&case_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_note_record).collect())
    }

    async fn create_note(
        &self,
        params: &CreateNoteParams,
    ) -> Result<InternalNoteRecord, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "INSERT INTO internal_notes (id, case_id, agent_id, note_content) \
                 VALUES ($1, $2, $3, $4) \
                 RETURNING id, case_id, agent_id, note_content, created_at, updated_at",
                &[
                    &Uuid::new_v4(),
                    &params.case_id,
                    &params.agent_id,
                    &params.note_content,
                ],
            )
            .await?;
        Ok(row_to_note_record(&row))
    }
}

#[async_trait]
impl AttachmentStore for PgBackend {
    async fn create_attachment(
        &self,
        params: &CreateAttachmentParams,
    ) -> Result<AttachmentRecord, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "INSERT INTO attachments (id, case_id, uploader_id, file_path, file_name, \
                 file_size, file_type) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 RETURNING id, case_id, uploader_id, file_path, file_name, file_size, \
                           file_type, created_at, updated_at",
                &[
                    &Uuid::new_v4(),
                    &params.case_id,
                    &params.uploader_id,
                    &params.file_path,
                    &params.file_name,
                    &params.file_size,
                    &params.file_type,
                ],
            )
            .await?;
        Ok(row_to_attachment_record(&row))
    }

    async fn find_attachment(
        &self,
        id: Uuid,
    ) -> Result<Option<AttachmentRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT id, case_id, uploader_id, file_path, file_name, file_size, file_type, \
                        created_at, updated_at \
                 FROM attachments WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_attachment_record))
    }

    async fn list_attachments(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<AttachmentWithUploader>, DatabaseError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {ATTACHMENT_WITH_UPLOADER_COLUMNS} \
                     FROM attachments a JOIN users u ON u.id = a.uploader_id \
                     WHERE a.case_id = $1 ORDER BY a.created_at DESC"
                ),
                &[&case_id],
            )
            .await?;
        rows.iter().map(row_to_attachment_with_uploader).collect()
    }

    async fn delete_attachment(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.pool.get().await?;
        let count = conn
            .execute("DELETE FROM attachments WHERE id = $1", &[&id])
            .await?;
        Ok(count > 0)
    }

    async fn link_message_attachment(
        &self,
        message_id: Uuid,
        attachment_id: Uuid,
    ) -> Result<(), DatabaseError> {
        let conn = self.pool.get().await?;
        conn.execute(
            "INSERT INTO message_attachments (id, message_id, attachment_id) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (message_id, attachment_id) DO NOTHING",
            &[&Uuid::new_v4(), &message_id, &attachment_id],
        )
        .await?;
        Ok(())
    }

    async fn list_message_attachments(
        &self,
        message_id: Uuid,
    ) -> Result<Vec<AttachmentWithUploader>, DatabaseError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {ATTACHMENT_WITH_UPLOADER_COLUMNS} \
                     FROM message_attachments ma \
                     JOIN attachments a ON a.id = ma.attachment_id \
                     JOIN users u ON u.id = a.uploader_id \
                     WHERE ma.message_id = $1 ORDER BY a.created_at ASC"
                ),
                &[&message_id],
            )
            .await?;
        rows.iter().map(row_to_attachment_with_uploader).collect()
    }
}

#[async_trait]
impl FeedbackStore for PgBackend {
    async fn get_feedback(
        &self,
        case_id: Uuid,
    ) -> Result<Option<FeedbackRecord>, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT id, case_id, client_id, rating, comments, created_at, updated_at \
                 FROM feedback WHERE case_id = $1",
                &[&case_id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_feedback_record))
    }

    async fn upsert_feedback(
        &self,
        params: &UpsertFeedbackParams,
    ) -> Result<FeedbackRecord, DatabaseError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "INSERT INTO feedback (id, case_id, client_id, rating, comments) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (case_id) DO UPDATE \
                 SET rating = EXCLUDED.rating, comments = EXCLUDED.comments, \
                     updated_at = NOW() \
                 RETURNING id, case_id, client_id, rating, comments, created_at, updated_at",
                &[
                    &Uuid::new_v4(),
                    &params.case_id,
                    &params.client_id,
                    &params.rating,
                    &params.comments,
                ],
            )
            .await?;
        Ok(row_to_feedback_record(&row))
    }
}
