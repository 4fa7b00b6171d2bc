/// REST client for the IM backend
use crate::config::Config;
use crate::error::{ImError, Result};
use crate::messenger_types::{
    Attachment, Conversation, ConversationFilter, CreateDmRequest, CreateGroupRequest,
    HistoryPage, MarkReadRequest, Message, SendFileRequest, SendTextRequest, UploadRequest,
};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Calls the read and write paths need from the backend.
///
/// The session controller and poller only see this trait, so tests can
/// script the backend without a network.
#[async_trait]
pub trait ImApi: Send + Sync {
    /// Latest page (cursor None) or the page before `cursor`
    async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<HistoryPage>;

    async fn send_text(&self, req: &SendTextRequest) -> Result<Message>;

    async fn send_file(&self, req: &SendFileRequest) -> Result<Message>;

    async fn list_conversations(&self, filter: &ConversationFilter) -> Result<Vec<Conversation>>;

    /// Get or create the DM for (hotel, owner, admin)
    async fn create_dm(&self, req: &CreateDmRequest) -> Result<Conversation>;

    async fn create_group(&self, req: &CreateGroupRequest) -> Result<Conversation>;

    async fn mark_read(&self, req: &MarkReadRequest) -> Result<()>;

    /// Upload raw bytes (sent base64-encoded) and get attachment metadata back
    async fn upload(&self, file_name: &str, mime_type: &str, content: &[u8]) -> Result<Attachment>;
}

/// `ImApi` over HTTP with a bearer token
#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpApi {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.api_base_url.clone(),
            token: config.identity.token.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn conversation_url(&self, conversation_id: &str, suffix: &str) -> String {
        self.url(&format!(
            "/conversations/{}{}",
            urlencoding::encode(conversation_id),
            suffix
        ))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String, query: &[(&str, String)]) -> Result<T> {
        debug!("GET {}", url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;
        decode(resp).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(&self, url: String, body: &B) -> Result<T> {
        debug!("POST {}", url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }
}

/// Map non-2xx to `ImError::Status` (409 = duplicate send) and decode the body
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status == reqwest::StatusCode::CONFLICT {
        return Err(ImError::DuplicateMessage);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ImError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let bytes = resp.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl ImApi for HttpApi {
    async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<HistoryPage> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        self.get_json(self.conversation_url(conversation_id, "/history"), &query)
            .await
    }

    async fn send_text(&self, req: &SendTextRequest) -> Result<Message> {
        self.post_json(
            self.conversation_url(&req.conversation_id, "/messages:sendText"),
            req,
        )
        .await
    }

    async fn send_file(&self, req: &SendFileRequest) -> Result<Message> {
        self.post_json(
            self.conversation_url(&req.conversation_id, "/messages:sendFile"),
            req,
        )
        .await
    }

    async fn list_conversations(&self, filter: &ConversationFilter) -> Result<Vec<Conversation>> {
        let mut query = Vec::new();
        if let Some(kind) = filter.kind {
            let kind = serde_json::to_value(kind)?;
            query.push(("type", kind.as_str().unwrap_or_default().to_string()));
        }
        if let Some(hotel_id) = &filter.hotel_id {
            query.push(("hotel_id", hotel_id.clone()));
        }
        // Either a bare array or {"items": [...]}
        let value: serde_json::Value = self.get_json(self.url("/conversations"), &query).await?;
        let list = match value {
            serde_json::Value::Object(mut map) => map.remove("items").unwrap_or_default(),
            other => other,
        };
        if list.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(list)?)
    }

    async fn create_dm(&self, req: &CreateDmRequest) -> Result<Conversation> {
        self.post_json(self.url("/conversations/dm"), req).await
    }

    async fn create_group(&self, req: &CreateGroupRequest) -> Result<Conversation> {
        self.post_json(self.url("/conversations/group"), req).await
    }

    async fn mark_read(&self, req: &MarkReadRequest) -> Result<()> {
        let _: serde_json::Value = self
            .post_json(self.conversation_url(&req.conversation_id, "/read"), req)
            .await?;
        Ok(())
    }

    async fn upload(&self, file_name: &str, mime_type: &str, content: &[u8]) -> Result<Attachment> {
        let req = UploadRequest {
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            data: general_purpose::STANDARD.encode(content),
        };
        self.post_json(self.url("/uploads:base64"), &req).await
    }
}
