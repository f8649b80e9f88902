//! Attachment upload, download, and deletion handlers.
//!
//! Uploads are multipart: one `file` field plus an optional `message_id`
//! field linking the attachment to a message on the same case. The object
//! is stored first and rolled back if the metadata insert fails.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::db::CreateAttachmentParams;
use crate::error::StorageError;
use crate::gateway::server::{db_error, ensure_case_access, load_case, AppState};
use crate::gateway::sse::CaseBroadcast;
use crate::gateway::types::{
    ActionResponse, AttachmentListResponse, AttachmentResponse, CaseEvent,
};
use crate::storage;

/// Maximum size accepted for a single uploaded file (10 MiB).
pub const UPLOAD_FILE_SIZE_LIMIT: usize = 10 * 1024 * 1024;
/// Request body cap for the upload route; leaves room for multipart framing.
pub const UPLOAD_BODY_LIMIT: usize = UPLOAD_FILE_SIZE_LIMIT + 64 * 1024;

fn storage_error(e: StorageError) -> (StatusCode, String) {
    match &e {
        StorageError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
        StorageError::InvalidPath(_) => (StatusCode::BAD_REQUEST, e.to_string()),
        StorageError::Io { .. } => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn attachments_list_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<AttachmentListResponse>, (StatusCode, String)> {
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;

    let attachments = state.db.list_attachments(id).await.map_err(db_error)?;
    Ok(Json(AttachmentListResponse { attachments }))
}

pub async fn message_attachments_list_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<AttachmentListResponse>, (StatusCode, String)> {
    let message = state
        .db
        .find_message(id)
        .await
        .map_err(db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Message not found".to_string()))?;
    let case = load_case(&state, message.case_id).await?;
    ensure_case_access(&user, &case)?;

    let attachments = state
        .db
        .list_message_attachments(id)
        .await
        .map_err(db_error)?;
    Ok(Json(AttachmentListResponse { attachments }))
}

pub async fn attachment_upload_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<AttachmentResponse>), (StatusCode, String)> {
    let case = load_case(&state, id).await?;
    ensure_case_access(&user, &case)?;

    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut message_id: Option<Uuid> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("Multipart read error: {e}"),
        )
    })? {
        // Field accessors borrow while `bytes()`/`text()` consume; copy the
        // name out first.
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                let raw_name = field.file_name().unwrap_or("document").to_string();
                let file_name = storage::sanitize_file_name(&raw_name);
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| storage::content_type_for(&file_name));

                let data = field.bytes().await.map_err(|e| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("Failed to read upload body: {e}"),
                    )
                })?;
                if data.len() > UPLOAD_FILE_SIZE_LIMIT {
                    return Err((
                        StatusCode::PAYLOAD_TOO_LARGE,
                        format!(
                            "File '{}' exceeds the 10 MiB upload limit ({} bytes)",
                            raw_name,
                            data.len()
                        ),
                    ));
                }
                file = Some((file_name, content_type, data.to_vec()));
            }
            Some("message_id") => {
                let raw = field.text().await.map_err(|e| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("Failed to read message_id field: {e}"),
                    )
                })?;
                let parsed = Uuid::parse_str(raw.trim()).map_err(|_| {
                    (
                        StatusCode::BAD_REQUEST,
                        "Invalid message_id (expected UUID)".to_string(),
                    )
                })?;
                message_id = Some(parsed);
            }
            _ => {}
        }
    }

    let (file_name, content_type, data) = file.ok_or((
        StatusCode::BAD_REQUEST,
        "A 'file' field is required".to_string(),
    ))?;

    // Validate the message link before writing anything.
    if let Some(message_id) = message_id {
        let message = state
            .db
            .find_message(message_id)
            .await
            .map_err(db_error)?
            .ok_or((
                StatusCode::UNPROCESSABLE_ENTITY,
                "Unknown message".to_string(),
            ))?;
        if message.case_id != id {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                "Message belongs to a different case".to_string(),
            ));
        }
    }

    let file_path = storage::generate_object_path(id, &file_name);
    state
        .storage
        .put(&file_path, &data)
        .await
        .map_err(storage_error)?;

    let created = state
        .db
        .create_attachment(&CreateAttachmentParams {
            case_id: id,
            uploader_id: user.id,
            file_path: file_path.clone(),
            file_name,
            file_size: data.len() as i64,
            file_type: content_type,
        })
        .await;
    let attachment = match created {
        Ok(attachment) => attachment,
        Err(e) => {
            // Metadata insert failed; take the stored object back out.
            if let Err(cleanup) = state.storage.delete(&file_path).await {
                tracing::warn!(
                    "Failed to remove orphaned object {}: {}",
                    file_path,
                    cleanup
                );
            }
            return Err(db_error(e));
        }
    };

    if let Some(message_id) = message_id {
        state
            .db
            .link_message_attachment(message_id, attachment.id)
            .await
            .map_err(db_error)?;
    }

    state.feed.publish(CaseBroadcast {
        case_id: id,
        author_id: user.id,
        event: CaseEvent::Attachment {
            attachment: attachment.clone(),
        },
    });

    Ok((StatusCode::CREATED, Json(AttachmentResponse { attachment })))
}

pub async fn attachment_download_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let attachment = state
        .db
        .find_attachment(id)
        .await
        .map_err(db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Attachment not found".to_string()))?;
    let case = load_case(&state, attachment.case_id).await?;
    ensure_case_access(&user, &case)?;

    let data = state
        .storage
        .read(&attachment.file_path)
        .await
        .map_err(storage_error)?;

    let content_type = HeaderValue::from_str(&attachment.file_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", attachment.file_name))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    ))
}

pub async fn attachment_delete_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<ActionResponse>, (StatusCode, String)> {
    let attachment = state
        .db
        .find_attachment(id)
        .await
        .map_err(db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Attachment not found".to_string()))?;
    let case = load_case(&state, attachment.case_id).await?;

    // The uploader can always remove their file; staff can remove any file
    // on a case they can see.
    if user.id != attachment.uploader_id {
        if !user.role.is_staff() {
            return Err((
                StatusCode::FORBIDDEN,
                "Only the uploader or staff can delete an attachment".to_string(),
            ));
        }
        ensure_case_access(&user, &case)?;
    }

    // Storage object first, metadata row second; join rows cascade with it.
    state
        .storage
        .delete(&attachment.file_path)
        .await
        .map_err(storage_error)?;
    state
        .db
        .delete_attachment(attachment.id)
        .await
        .map_err(db_error)?;

    Ok(Json(ActionResponse::ok("Attachment deleted")))
}
