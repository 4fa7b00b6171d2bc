/// In-memory conversation and message store behind the development backend
use crate::error::{ImError, Result};
use crate::messenger_types::{
    Attachment, Conversation, ConversationFilter, ConversationKind, CreateGroupRequest,
    HistoryPage, LastMessage, Message, MessageKind, UploadRequest,
};
use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Same sender + same text inside this window is rejected as a double send
const DUPLICATE_WINDOW_MS: i64 = 500;
const STREAM_BUFFER: usize = 256;

#[derive(Default)]
struct StoreInner {
    conversations: HashMap<String, Conversation>,
    participants: HashMap<String, HashSet<String>>,
    /// Per conversation, in insertion (= time) order
    messages: HashMap<String, Vec<Message>>,
    last_read: HashMap<(String, String), String>,
    uploads: HashMap<String, Attachment>,
    streams: HashMap<String, broadcast::Sender<Message>>,
}

/// Cheap to clone; all clones share the same data
#[derive(Clone, Default)]
pub struct MessageStore {
    inner: Arc<RwLock<StoreInner>>,
}

/// What a message insert needs besides the conversation
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: String,
    pub sender_role: Option<String>,
    pub kind: MessageKind,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the unique DM for (hotel, owner, admin)
    pub async fn upsert_dm(
        &self,
        hotel_id: &str,
        owner_id: &str,
        admin_id: &str,
        created_by: &str,
    ) -> Conversation {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.conversations.values().find(|c| {
            c.kind == ConversationKind::Dm
                && c.hotel_id.as_deref() == Some(hotel_id)
                && c.owner_id.as_deref() == Some(owner_id)
                && c.admin_id.as_deref() == Some(admin_id)
        }) {
            return existing.clone();
        }

        let conv = Conversation {
            id: Uuid::new_v4().to_string(),
            kind: ConversationKind::Dm,
            subtype: Some("admin_owner_dm".to_string()),
            hotel_id: Some(hotel_id.to_string()),
            owner_id: Some(owner_id.to_string()),
            admin_id: Some(admin_id.to_string()),
            name: None,
            created_by: Some(created_by.to_string()),
            created_at: Some(Utc::now()),
            last_message: None,
        };
        let members = [owner_id, admin_id].iter().map(|s| s.to_string()).collect();
        inner.participants.insert(conv.id.clone(), members);
        inner.conversations.insert(conv.id.clone(), conv.clone());
        conv
    }

    pub async fn create_group(&self, req: &CreateGroupRequest, created_by: &str) -> Conversation {
        let mut inner = self.inner.write().await;
        let conv = Conversation {
            id: Uuid::new_v4().to_string(),
            kind: ConversationKind::Group,
            subtype: Some(
                req.subtype
                    .clone()
                    .unwrap_or_else(|| "admin_owner_staff".to_string()),
            ),
            hotel_id: Some(req.hotel_id.clone()),
            owner_id: None,
            admin_id: None,
            name: Some(req.name.clone()),
            created_by: Some(created_by.to_string()),
            created_at: Some(Utc::now()),
            last_message: None,
        };
        let mut members: HashSet<String> = req.member_ids.iter().cloned().collect();
        members.insert(created_by.to_string());
        inner.participants.insert(conv.id.clone(), members);
        inner.conversations.insert(conv.id.clone(), conv.clone());
        conv
    }

    /// Conversations `user_id` takes part in, newest first
    pub async fn list(&self, filter: &ConversationFilter, user_id: &str) -> Vec<Conversation> {
        let inner = self.inner.read().await;
        let mut list: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| filter.kind.map_or(true, |k| c.kind == k))
            .filter(|c| {
                filter
                    .hotel_id
                    .as_deref()
                    .map_or(true, |h| c.hotel_id.as_deref() == Some(h))
            })
            .filter(|c| {
                inner
                    .participants
                    .get(&c.id)
                    .is_some_and(|members| members.contains(user_id))
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub async fn exists(&self, conversation_id: &str) -> bool {
        self.inner
            .read()
            .await
            .conversations
            .contains_key(conversation_id)
    }

    pub async fn is_member(&self, conversation_id: &str, user_id: &str) -> bool {
        self.inner
            .read()
            .await
            .participants
            .get(conversation_id)
            .is_some_and(|members| members.contains(user_id))
    }

    pub async fn add_member(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let members = inner
            .participants
            .get_mut(conversation_id)
            .ok_or_else(|| ImError::Validation(format!("unknown conversation {}", conversation_id)))?;
        members.insert(user_id.to_string());
        Ok(())
    }

    /// Append a message, update the conversation preview and fan it out to streams
    pub async fn insert_message(&self, conversation_id: &str, new: NewMessage) -> Result<Message> {
        let mut inner = self.inner.write().await;
        if !inner.conversations.contains_key(conversation_id) {
            return Err(ImError::Validation(format!("unknown conversation {}", conversation_id)));
        }

        let now = Utc::now();
        let history = inner.messages.entry(conversation_id.to_string()).or_default();
        let window = ChronoDuration::milliseconds(DUPLICATE_WINDOW_MS);
        let duplicate = history.iter().rev().take_while(|m| now - m.created_at < window).any(|m| {
            m.sender_id == new.sender_id
                && m.kind == new.kind
                && m.text.as_deref() == Some(new.text.as_str())
                && m.attachments == new.attachments
        });
        if duplicate {
            return Err(ImError::DuplicateMessage);
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: new.sender_id,
            sender_role: new.sender_role,
            kind: new.kind,
            text: Some(new.text),
            attachments: new.attachments,
            links: Vec::new(),
            created_at: now,
        };
        history.push(message.clone());

        if let Some(conv) = inner.conversations.get_mut(conversation_id) {
            conv.last_message = Some(LastMessage {
                message_id: message.id.clone(),
                text: Some(message.preview()),
                at: now,
            });
        }
        if let Some(tx) = inner.streams.get(conversation_id) {
            // No subscribers is fine
            let _ = tx.send(message.clone());
        }
        Ok(message)
    }

    /// Seek pagination: newest `limit` messages older than `cursor`, newest first
    pub async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<HistoryPage> {
        let inner = self.inner.read().await;
        let all = inner
            .messages
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let end = match cursor {
            Some(cursor) => all
                .iter()
                .position(|m| m.id == cursor)
                .ok_or_else(|| ImError::Validation(format!("unknown cursor {}", cursor)))?,
            None => all.len(),
        };
        let start = end.saturating_sub(limit.max(1));
        let page = &all[start..end];

        Ok(HistoryPage {
            items: page.iter().rev().cloned().collect(),
            next_cursor: (start > 0).then(|| all[start].id.clone()),
        })
    }

    pub async fn mark_read(&self, conversation_id: &str, user_id: &str, message_id: &str) {
        self.inner.write().await.last_read.insert(
            (conversation_id.to_string(), user_id.to_string()),
            message_id.to_string(),
        );
    }

    pub async fn last_read(&self, conversation_id: &str, user_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .last_read
            .get(&(conversation_id.to_string(), user_id.to_string()))
            .cloned()
    }

    /// Store an upload and return its metadata
    pub async fn save_upload(&self, req: &UploadRequest) -> Result<Attachment> {
        let content = general_purpose::STANDARD
            .decode(req.data.as_bytes())
            .map_err(|e| ImError::Validation(format!("invalid base64: {}", e)))?;
        let attachment = Attachment {
            gridfs_id: Some(Uuid::new_v4().to_string()),
            file_name: req.file_name.clone(),
            mime_type: Some(req.mime_type.clone()),
            size: Some(content.len() as u64),
        };
        if let Some(id) = &attachment.gridfs_id {
            self.inner
                .write()
                .await
                .uploads
                .insert(id.clone(), attachment.clone());
        }
        Ok(attachment)
    }

    /// Live feed of new messages in one conversation
    pub async fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<Message> {
        let mut inner = self.inner.write().await;
        inner
            .streams
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(STREAM_BUFFER).0)
            .subscribe()
    }

    /// Forget the conversation's feed once its last subscriber is gone
    pub async fn release_stream(&self, conversation_id: &str) {
        let mut inner = self.inner.write().await;
        if inner
            .streams
            .get(conversation_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            inner.streams.remove(conversation_id);
        }
    }

    /// Conversations with a live feed
    pub async fn open_streams(&self) -> usize {
        self.inner.read().await.streams.len()
    }

    /// Message count of a conversation
    pub async fn count(&self, conversation_id: &str) -> usize {
        self.inner
            .read()
            .await
            .messages
            .get(conversation_id)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(sender: &str, body: &str) -> NewMessage {
        NewMessage {
            sender_id: sender.to_string(),
            sender_role: None,
            kind: MessageKind::Text,
            text: body.to_string(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_dm_is_unique_per_triple() {
        let store = MessageStore::new();
        let a = store.upsert_dm("h1", "owner", "admin", "owner").await;
        let b = store.upsert_dm("h1", "owner", "admin", "admin").await;
        let c = store.upsert_dm("h2", "owner", "admin", "owner").await;
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert!(store.is_member(&a.id, "admin").await);
        assert!(!store.is_member(&a.id, "stranger").await);
        assert_eq!(store.list(&ConversationFilter::default(), "owner").await.len(), 2);
        assert!(store.list(&ConversationFilter::default(), "stranger").await.is_empty());
    }

    #[tokio::test]
    async fn test_history_pages_backwards() {
        let store = MessageStore::new();
        let conv = store.upsert_dm("h1", "owner", "admin", "owner").await;
        for i in 0..5 {
            store
                .insert_message(&conv.id, text("owner", &format!("msg {}", i)))
                .await
                .unwrap();
        }

        let first = store.history(&conv.id, 2, None).await.unwrap();
        let texts: Vec<_> = first.items.iter().map(|m| m.text.clone().unwrap()).collect();
        assert_eq!(texts, vec!["msg 4", "msg 3"]);

        let second = store
            .history(&conv.id, 2, first.next_cursor.as_deref())
            .await
            .unwrap();
        let texts: Vec<_> = second.items.iter().map(|m| m.text.clone().unwrap()).collect();
        assert_eq!(texts, vec!["msg 2", "msg 1"]);

        let last = store
            .history(&conv.id, 2, second.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.next_cursor, None);

        assert!(store.history(&conv.id, 2, Some("nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_quick_double_send_is_rejected() {
        let store = MessageStore::new();
        let conv = store.upsert_dm("h1", "owner", "admin", "owner").await;
        store.insert_message(&conv.id, text("owner", "hello")).await.unwrap();
        let err = store.insert_message(&conv.id, text("owner", "hello")).await.unwrap_err();
        assert!(matches!(err, ImError::DuplicateMessage));
        // someone else saying the same thing is fine
        store.insert_message(&conv.id, text("admin", "hello")).await.unwrap();
        assert_eq!(store.count(&conv.id).await, 2);
    }

    #[tokio::test]
    async fn test_insert_fans_out_and_updates_preview() {
        let store = MessageStore::new();
        let conv = store.upsert_dm("h1", "owner", "admin", "owner").await;
        let mut rx = store.subscribe(&conv.id).await;

        let sent = store.insert_message(&conv.id, text("admin", "welcome")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, sent.id);

        let listed = store.list(&ConversationFilter::default(), "owner").await;
        let preview = listed[0].last_message.clone().unwrap();
        assert_eq!(preview.message_id, sent.id);
        assert_eq!(preview.text.as_deref(), Some("welcome"));
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_base64() {
        let store = MessageStore::new();
        let ok = store
            .save_upload(&UploadRequest {
                file_name: "a.txt".into(),
                mime_type: "text/plain".into(),
                data: general_purpose::STANDARD.encode(b"abc"),
            })
            .await
            .unwrap();
        assert_eq!(ok.size, Some(3));

        let bad = store
            .save_upload(&UploadRequest {
                file_name: "a.txt".into(),
                mime_type: "text/plain".into(),
                data: "!!!".into(),
            })
            .await;
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn test_released_stream_is_dropped_only_when_unused() {
        let store = MessageStore::new();
        let conv = store.upsert_dm("h1", "owner", "admin", "owner").await;

        let first = store.subscribe(&conv.id).await;
        let second = store.subscribe(&conv.id).await;
        assert_eq!(store.open_streams().await, 1);

        drop(first);
        store.release_stream(&conv.id).await;
        assert_eq!(store.open_streams().await, 1);

        drop(second);
        store.release_stream(&conv.id).await;
        assert_eq!(store.open_streams().await, 0);

        // Unknown conversation is a no-op
        store.release_stream("missing").await;
    }
}
