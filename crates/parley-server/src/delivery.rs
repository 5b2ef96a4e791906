//! Message delivery.
//!
//! Both the REST API and the live channel send messages through
//! [`MessageDeliveryCoordinator`]. A message is persisted first and only
//! broadcast once the write has committed; a failed write broadcasts nothing
//! and a partial broadcast never undoes the write.

use crate::blob::BlobStore;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use parley_core::{ConnectionId, Hub};
use parley_protocol::{
    ChatId, Message, MessageBody, MessageDraft, MessageId, ServerEvent, UserId, MAX_CONTENT_LEN,
};
use parley_store::{ChatStore, NewMessage};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Persists messages and fans them out to chat rooms.
pub struct MessageDeliveryCoordinator {
    store: Arc<dyn ChatStore>,
    hub: Arc<Hub>,
    blobs: Arc<dyn BlobStore>,
}

impl MessageDeliveryCoordinator {
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, hub: Arc<Hub>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, hub, blobs }
    }

    /// Persist a message from `sender` and broadcast `message:receive` to the
    /// chat's room, skipping `origin` (the sending connection, if any).
    ///
    /// # Errors
    ///
    /// Fails if the draft is empty or too long, references a file this
    /// server did not store, or the sender is not a participant.
    pub async fn send(
        &self,
        sender: UserId,
        chat_id: ChatId,
        draft: MessageDraft,
        origin: Option<&ConnectionId>,
    ) -> ApiResult<Message> {
        let start = Instant::now();
        if !draft.content_fits() {
            return Err(ApiError::invalid(format!(
                "Message exceeds {MAX_CONTENT_LEN} bytes"
            )));
        }

        // Attachment metadata is taken from the blob store, only the URL
        // comes from the client.
        let attachment = match draft.attachment {
            Some(claimed) => Some(
                self.blobs
                    .describe(&claimed.url)
                    .await
                    .map_err(ApiError::internal)?
                    .ok_or_else(|| ApiError::invalid("Unknown attachment"))?,
            ),
            None => None,
        };
        let body = MessageBody::from_parts(draft.content, attachment)?;

        let message = self
            .store
            .insert_message(NewMessage {
                chat_id,
                sender_id: sender,
                body,
            })
            .await?;
        metrics::record_persisted();

        let report = self.hub.broadcast_to_chat(
            chat_id,
            ServerEvent::MessageReceive {
                chat_id,
                message: message.clone(),
            },
            origin,
        );
        metrics::record_delivery(report);
        metrics::record_latency(start.elapsed().as_secs_f64());

        debug!(
            message = %message.id,
            chat = %chat_id,
            delivered = report.delivered,
            dropped = report.dropped,
            "Delivered message"
        );
        Ok(message)
    }

    /// Delete a message sent by `requester`. Copies already delivered are
    /// not retracted.
    ///
    /// # Errors
    ///
    /// Fails with not-found for unknown messages and forbidden for messages
    /// sent by someone else.
    pub async fn delete(&self, requester: UserId, message_id: MessageId) -> ApiResult<ChatId> {
        Ok(self.store.delete_message(message_id, requester).await?)
    }

    /// Record that `user` has read a message.
    ///
    /// # Errors
    ///
    /// Fails if the message does not exist or `user` is not a participant.
    pub async fn mark_read(&self, user: UserId, message_id: MessageId) -> ApiResult<Message> {
        Ok(self.store.mark_read(message_id, user).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use bytes::Bytes;
    use parley_core::HubConfig;
    use parley_protocol::{Attachment, AttachmentKind};
    use parley_store::{NewUser, SqliteStore};

    struct Fixture {
        coordinator: MessageDeliveryCoordinator,
        store: Arc<SqliteStore>,
        hub: Arc<Hub>,
        blobs: Arc<LocalBlobStore>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let blobs = Arc::new(LocalBlobStore::new(dir.path()));
        let coordinator =
            MessageDeliveryCoordinator::new(store.clone(), hub.clone(), blobs.clone());
        Fixture {
            coordinator,
            store,
            hub,
            blobs,
            _dir: dir,
        }
    }

    async fn user(store: &SqliteStore, name: &str) -> UserId {
        store
            .create_user(NewUser {
                name: name.to_string(),
                email: format!("{name}@example.com"),
                password_hash: "x".to_string(),
                avatar: None,
            })
            .await
            .unwrap()
            .id()
    }

    #[tokio::test]
    async fn test_send_persists_then_broadcasts_without_echo() {
        let f = fixture().await;
        let alice = user(&f.store, "alice").await;
        let bob = user(&f.store, "bob").await;
        let (chat, _) = f.store.create_private_chat(alice, bob).await.unwrap();

        let mut alice_conn = f.hub.admit(alice, &[chat.id]).unwrap();
        let mut bob_conn = f.hub.admit(bob, &[chat.id]).unwrap();
        while alice_conn.outbound.try_recv().is_ok() {}

        let message = f
            .coordinator
            .send(alice, chat.id, MessageDraft::text("hi"), Some(alice_conn.handle.id()))
            .await
            .unwrap();

        let received = bob_conn.outbound.try_recv().unwrap();
        assert_eq!(
            *received,
            ServerEvent::MessageReceive {
                chat_id: chat.id,
                message: message.clone(),
            }
        );
        assert!(alice_conn.outbound.try_recv().is_err());

        let history = f
            .store
            .list_messages(chat.id, bob, Default::default())
            .await
            .unwrap();
        assert_eq!(history[0].id, message.id);
    }

    #[tokio::test]
    async fn test_failed_persist_broadcasts_nothing() {
        let f = fixture().await;
        let alice = user(&f.store, "alice").await;
        let bob = user(&f.store, "bob").await;
        let mallory = user(&f.store, "mallory").await;
        let (chat, _) = f.store.create_private_chat(alice, bob).await.unwrap();
        let mut bob_conn = f.hub.admit(bob, &[chat.id]).unwrap();

        let err = f
            .coordinator
            .send(mallory, chat.id, MessageDraft::text("spam"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 403);

        let err = f
            .coordinator
            .send(alice, chat.id, MessageDraft::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 400);

        while let Ok(event) = bob_conn.outbound.try_recv() {
            assert!(!matches!(*event, ServerEvent::MessageReceive { .. }));
        }
    }

    #[tokio::test]
    async fn test_foreign_attachment_rejected() {
        let f = fixture().await;
        let alice = user(&f.store, "alice").await;
        let bob = user(&f.store, "bob").await;
        let (chat, _) = f.store.create_private_chat(alice, bob).await.unwrap();

        let draft = MessageDraft {
            content: None,
            attachment: Some(Attachment {
                kind: AttachmentKind::Image,
                url: "https://evil.example/x.png".to_string(),
                name: "x.png".to_string(),
                size: 1,
                mime_type: "image/png".to_string(),
            }),
        };
        let err = f.coordinator.send(alice, chat.id, draft, None).await.unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[tokio::test]
    async fn test_attachment_metadata_comes_from_blob_store() {
        let f = fixture().await;
        let alice = user(&f.store, "alice").await;
        let bob = user(&f.store, "bob").await;
        let (chat, _) = f.store.create_private_chat(alice, bob).await.unwrap();

        let stored = f
            .blobs
            .store(Bytes::from_static(b"%PDF-1.4"), "report.pdf", "application/pdf")
            .await
            .unwrap();
        let spoofed = Attachment {
            kind: AttachmentKind::Image,
            url: stored.url.clone(),
            name: "cat.png".to_string(),
            size: 1,
            mime_type: "image/png".to_string(),
        };
        let draft = MessageDraft {
            content: None,
            attachment: Some(spoofed),
        };

        let message = f.coordinator.send(alice, chat.id, draft, None).await.unwrap();
        assert_eq!(message.body.attachment(), Some(&stored));

        let history = f
            .store
            .list_messages(chat.id, bob, Default::default())
            .await
            .unwrap();
        let persisted = history[0].body.attachment().unwrap();
        assert_eq!(persisted.kind, AttachmentKind::File);
        assert_eq!(persisted.mime_type, "application/pdf");
        assert_eq!(persisted.size, 8);
    }

    #[tokio::test]
    async fn test_oversized_content_rejected() {
        let f = fixture().await;
        let alice = user(&f.store, "alice").await;
        let bob = user(&f.store, "bob").await;
        let (chat, _) = f.store.create_private_chat(alice, bob).await.unwrap();

        let draft = MessageDraft::text("x".repeat(MAX_CONTENT_LEN + 1));
        let err = f.coordinator.send(alice, chat.id, draft, None).await.unwrap_err();
        assert_eq!(err.code(), 400);

        let chat = f.store.find_chat(chat.id, alice).await.unwrap();
        assert_eq!(chat.message_count, 0);
    }
}
