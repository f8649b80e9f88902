//! Per-case live feed over Server-Sent Events.
//!
//! Inserts are fanned out through one process-wide broadcast channel; each
//! SSE connection filters for its case and role. A connection registers its
//! receiver *before* fetching the snapshot, then replays the snapshot and
//! streams live inserts, deduplicating through [`LiveFeed`] so the
//! snapshot/broadcast race never shows a row twice.

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::db::Database;
use crate::error::DatabaseError;
use crate::gateway::types::CaseEvent;
use crate::live::LiveFeed;

const BROADCAST_CAPACITY: usize = 256;
const CONNECTION_BUFFER: usize = 64;

/// One insert, addressed to a case, with its author for notification
/// routing.
#[derive(Debug, Clone)]
pub struct CaseBroadcast {
    pub case_id: Uuid,
    pub author_id: Uuid,
    pub event: CaseEvent,
}

/// Process-wide fan-out hub for case inserts.
#[derive(Clone)]
pub struct FeedHub {
    tx: broadcast::Sender<CaseBroadcast>,
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Publish an insert. Lack of subscribers is not an error.
    pub fn publish(&self, broadcast: CaseBroadcast) {
        let _ = self.tx.send(broadcast);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaseBroadcast> {
        self.tx.subscribe()
    }
}

fn notification_for(event: &CaseEvent) -> Option<CaseEvent> {
    match event {
        CaseEvent::Message { .. } => Some(CaseEvent::Notification {
            kind: "message",
            description: "You have received a new message",
        }),
        CaseEvent::InternalNote { .. } => Some(CaseEvent::Notification {
            kind: "internal_note",
            description: "A new internal note has been added",
        }),
        CaseEvent::Attachment { .. } => Some(CaseEvent::Notification {
            kind: "attachment",
            description: "A new attachment has been added",
        }),
        CaseEvent::Notification { .. } => None,
    }
}

fn to_sse_event(event: &CaseEvent) -> Result<Event, axum::Error> {
    Event::default().event(event.event_name()).json_data(event)
}

async fn send_event(tx: &mpsc::Sender<Result<Event, Infallible>>, event: &CaseEvent) -> bool {
    match to_sse_event(event) {
        Ok(sse_event) => tx.send(Ok(sse_event)).await.is_ok(),
        Err(e) => {
            tracing::warn!("Failed to serialize case event: {}", e);
            true
        }
    }
}

/// Open the merged snapshot+live stream for one case.
///
/// The receiver is owned by the spawned task; when the client disconnects
/// the `mpsc` side closes, the task returns, and the subscription is torn
/// down with it.
pub async fn case_feed(
    db: Arc<dyn Database>,
    hub: &FeedHub,
    case_id: Uuid,
    viewer: AuthenticatedUser,
) -> Result<Sse<KeepAliveStream<ReceiverStream<Result<Event, Infallible>>>>, DatabaseError> {
    // Subscribe before the snapshot fetch so no insert can fall between.
    let mut rx = hub.subscribe();

    let messages = db.list_messages(case_id).await?;
    let notes = if viewer.role.is_staff() {
        db.list_notes(case_id).await?
    } else {
        Vec::new()
    };
    let attachments = db.list_attachments(case_id).await?;

    let (tx, out_rx) = mpsc::channel::<Result<Event, Infallible>>(CONNECTION_BUFFER);

    tokio::spawn(async move {
        let mut message_feed = LiveFeed::new();
        let mut note_feed = LiveFeed::new();
        let mut attachment_feed = LiveFeed::new();

        for message in messages {
            if message_feed.apply(message.clone())
                && !send_event(&tx, &CaseEvent::Message { message }).await
            {
                return;
            }
        }
        for note in notes {
            if note_feed.apply(note.clone())
                && !send_event(&tx, &CaseEvent::InternalNote { note }).await
            {
                return;
            }
        }
        for with_uploader in attachments {
            let attachment = with_uploader.attachment;
            if attachment_feed.apply(attachment.clone())
                && !send_event(&tx, &CaseEvent::Attachment { attachment }).await
            {
                return;
            }
        }

        loop {
            let broadcast = match rx.recv().await {
                Ok(broadcast) => broadcast,
                // Fell too far behind; end the stream and let the client
                // re-open with a fresh snapshot.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%case_id, skipped, "SSE subscriber lagged, closing feed");
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            if broadcast.case_id != case_id {
                continue;
            }

            let fresh = match &broadcast.event {
                CaseEvent::Message { message } => message_feed.apply(message.clone()),
                CaseEvent::InternalNote { note } => {
                    if !viewer.role.is_staff() {
                        continue;
                    }
                    note_feed.apply(note.clone())
                }
                CaseEvent::Attachment { attachment } => {
                    attachment_feed.apply(attachment.clone())
                }
                CaseEvent::Notification { .. } => continue,
            };
            if !fresh {
                continue;
            }

            if !send_event(&tx, &broadcast.event).await {
                return;
            }
            if broadcast.author_id != viewer.id {
                if let Some(notification) = notification_for(&broadcast.event) {
                    if !send_event(&tx, &notification).await {
                        return;
                    }
                }
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(out_rx)).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::db::MessageRecord;

    fn message_event(case_id: Uuid, author_id: Uuid) -> CaseBroadcast {
        CaseBroadcast {
            case_id,
            author_id,
            event: CaseEvent::Message {
                message: MessageRecord {
                    id: Uuid::new_v4(),
                    case_id,
                    sender_id: author_id,
                    message_content: "any update?".to_string(),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
            },
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let hub = FeedHub::new();
        let mut rx = hub.subscribe();
        let case_id = Uuid::new_v4();
        hub.publish(message_event(case_id, Uuid::new_v4()));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.case_id, case_id);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let hub = FeedHub::new();
        hub.publish(message_event(Uuid::new_v4(), Uuid::new_v4()));
    }

    #[test]
    fn notifications_cover_every_insert_kind() {
        let case_id = Uuid::new_v4();
        let event = message_event(case_id, Uuid::new_v4()).event;
        let notification = notification_for(&event).unwrap();
        match notification {
            CaseEvent::Notification { kind, .. } => assert_eq!(kind, "message"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(notification_for(&notification).is_none());
    }
}
