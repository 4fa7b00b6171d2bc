/// Shared types for the IM layer (wire shapes of the backend)
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Conversation flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Dm,
    Group,
}

/// Denormalised preview of the newest message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    #[serde(deserialize_with = "de_id")]
    pub message_id: String,
    #[serde(default)]
    pub text: Option<String>,
    pub at: DateTime<Utc>,
}

/// A chat thread between a fixed set of participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(rename = "_id", alias = "id", deserialize_with = "de_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    /// e.g. "admin_owner_dm", "admin_owner_staff"
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub hotel_id: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub admin_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    File,
}

/// File metadata attached to a message (content lives in backend storage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub gridfs_id: Option<String>,
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// One immutable unit of communication within a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique per conversation; used for dedup only, never for ordering
    #[serde(rename = "_id", alias = "id", deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_id")]
    pub conversation_id: String,
    #[serde(default, deserialize_with = "de_id")]
    pub sender_id: String,
    #[serde(default)]
    pub sender_role: Option<String>,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Short human preview (text, else first attachment name)
    pub fn preview(&self) -> String {
        match (&self.text, self.attachments.first()) {
            (Some(text), _) if !text.is_empty() => text.clone(),
            (_, Some(att)) => att.file_name.clone(),
            _ => String::from("file"),
        }
    }
}

/// One page of history (seek pagination)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Newest first, as the backend returns them
    #[serde(default, alias = "messages")]
    pub items: Vec<Message>,
    #[serde(default, rename = "nextCursor", alias = "next_cursor")]
    pub next_cursor: Option<String>,
}

impl HistoryPage {
    /// Items oldest first
    pub fn chronological(&self) -> Vec<Message> {
        let mut items = self.items.clone();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    /// Id of the newest message on the page
    pub fn newest_id(&self) -> Option<&str> {
        self.items
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.created_at.cmp(&b.created_at).then(ib.cmp(ia)))
            .map(|(_, m)| m.id.as_str())
    }
}

/// `message.new` payload: the backend wraps the message, older builds send it bare
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NewMessagePayload {
    Wrapped { message: Message },
    Bare(Message),
}

impl NewMessagePayload {
    pub fn into_message(self) -> Message {
        match self {
            NewMessagePayload::Wrapped { message } => message,
            NewMessagePayload::Bare(message) => message,
        }
    }
}

/// Decoded SSE event on a conversation stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Ping,
    MessageNew(Message),
    /// Any event name we do not act on
    Other(String),
}

// ─── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendTextRequest {
    pub conversation_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendFileRequest {
    pub conversation_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDmRequest {
    pub hotel_id: String,
    pub owner_id: String,
    pub admin_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub hotel_id: String,
    pub name: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub member_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub conversation_id: String,
    pub last_read_message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    pub mime_type: String,
    /// Base64 file content
    pub data: String,
}

/// Query for listing conversations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationFilter {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ConversationKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hotel_id: Option<String>,
}

// ─── Id normalisation ────────────────────────────────────────────────────────

/// Accepts `"abc"`, `42` or `{"$oid": "abc"}` and yields the string form
fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = serde_json::Value::deserialize(deserializer)?;
    normalize_id(&value).ok_or_else(|| D::Error::custom(format!("invalid id: {}", value)))
}

/// String key for an id-like JSON value
pub fn normalize_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Object(map) => map.get("$oid").and_then(normalize_id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_message() {
        let msg: Message = serde_json::from_value(json!({
            "_id": "m1",
            "text": "hi",
            "created_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.text.as_deref(), Some("hi"));
        assert_eq!(msg.kind, MessageKind::Text);
        assert!(msg.conversation_id.is_empty());
        assert!(msg.links.is_empty());
    }

    #[test]
    fn test_link_previews_kept_as_is() {
        let preview = json!({"url": "https://example.com", "title": "Lobby"});
        let msg: Message = serde_json::from_value(json!({
            "_id": "m2",
            "links": [preview.clone()],
            "created_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(msg.links, vec![preview]);
    }

    #[test]
    fn test_ids_are_string_normalized() {
        let numeric: Message =
            serde_json::from_value(json!({"_id": 7, "created_at": "2024-01-01T00:00:00Z"})).unwrap();
        let oid: Message = serde_json::from_value(json!({
            "_id": {"$oid": "65a0"},
            "conversation_id": {"$oid": "c1"},
            "created_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(numeric.id, "7");
        assert_eq!(oid.id, "65a0");
        assert_eq!(oid.conversation_id, "c1");

        let bad = serde_json::from_value::<Message>(json!({"_id": true, "created_at": "2024-01-01T00:00:00Z"}));
        assert!(bad.is_err());
    }

    #[test]
    fn test_history_page_aliases() {
        let page: HistoryPage = serde_json::from_value(json!({
            "messages": [
                {"_id": "b", "created_at": "2024-01-01T00:00:02Z"},
                {"_id": "a", "created_at": "2024-01-01T00:00:01Z"}
            ]
        }))
        .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor, None);
        assert_eq!(page.newest_id(), Some("b"));
        let ids: Vec<_> = page.chronological().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let page: HistoryPage = serde_json::from_value(json!({"items": [], "nextCursor": "x"})).unwrap();
        assert_eq!(page.next_cursor.as_deref(), Some("x"));
        assert_eq!(page.newest_id(), None);
    }

    #[test]
    fn test_new_message_payload_shapes() {
        let wrapped: NewMessagePayload = serde_json::from_value(json!({
            "message": {"_id": "m1", "created_at": "2024-01-01T00:00:00Z"}
        }))
        .unwrap();
        let bare: NewMessagePayload =
            serde_json::from_value(json!({"_id": "m2", "created_at": "2024-01-01T00:00:00Z"})).unwrap();
        assert_eq!(wrapped.into_message().id, "m1");
        assert_eq!(bare.into_message().id, "m2");
    }

    #[test]
    fn test_conversation_wire_names() {
        let conv: Conversation = serde_json::from_value(json!({
            "_id": "c1",
            "type": "dm",
            "subtype": "admin_owner_dm",
            "hotel_id": "h1",
            "last_message": {"message_id": "m9", "text": "ok", "at": "2024-01-01T00:00:00Z"}
        }))
        .unwrap();
        assert_eq!(conv.kind, ConversationKind::Dm);
        assert_eq!(conv.last_message.unwrap().message_id, "m9");
        let back = serde_json::to_value(ConversationFilter {
            kind: Some(ConversationKind::Group),
            hotel_id: None,
        })
        .unwrap();
        assert_eq!(back, json!({"type": "group"}));
    }
}
