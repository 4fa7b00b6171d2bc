/// Development IM backend — REST + SSE over the in-memory store
///
/// Serves the same contract the client consumes, under `/api/v1/im`:
///   GET  /conversations                          ?type=dm|group&hotel_id=
///   POST /conversations/dm                       body: {"hotel_id","owner_id","admin_id"}
///   POST /conversations/group                    body: {"hotel_id","name","subtype","member_ids"}
///   GET  /conversations/:id/history              ?limit=N&cursor=<message id>
///   POST /conversations/:id/messages:sendText    body: {"conversation_id","text"}
///   POST /conversations/:id/messages:sendFile    body: {"conversation_id","text","attachments"}
///   POST /conversations/:id/read                 body: {"conversation_id","last_read_message_id"}
///   GET  /conversations/:id/stream               SSE: message.new + ping
///   POST /uploads:base64                         body: {"file_name","mime_type","data"}
///
/// Auth: `Authorization: Bearer <token>`; the token is taken as the user id.
use crate::config::DevServerConfig;
use crate::error::{ImError, Result};
use crate::message_store::{MessageStore, NewMessage};
use crate::messenger_types::{
    ConversationFilter, ConversationKind, CreateDmRequest, CreateGroupRequest, MarkReadRequest,
    MessageKind, SendFileRequest, SendTextRequest, UploadRequest,
};
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub const API_PREFIX: &str = "/api/v1/im";

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::UnsyncBoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed_unsync())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed_unsync()))
}

fn json_ok<T: serde::Serialize>(value: &T) -> Resp {
    match serde_json::to_vec(value) {
        Ok(body) => json_resp(StatusCode::OK, body),
        Err(e) => json_err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

fn store_err(e: ImError) -> Resp {
    match e {
        ImError::DuplicateMessage => json_resp(
            StatusCode::CONFLICT,
            serde_json::to_vec(&serde_json::json!({
                "error": "Duplicate message",
                "code": "DUPLICATE_MESSAGE",
            }))
            .unwrap_or_default(),
        ),
        ImError::Validation(msg) => json_err(StatusCode::BAD_REQUEST, &msg),
        other => json_err(StatusCode::INTERNAL_SERVER_ERROR, &other.to_string()),
    }
}

/// One SSE client's subscription. Dropping it releases the conversation's
/// feed once nobody else listens.
struct SseFeed {
    rx: Option<tokio::sync::broadcast::Receiver<crate::messenger_types::Message>>,
    store: MessageStore,
    conversation_id: String,
}

impl SseFeed {
    /// Next frame to write: a message, or a ping after `ping` of silence
    async fn next_frame(&mut self, ping: Duration) -> Option<Frame<bytes::Bytes>> {
        let rx = self.rx.as_mut()?;
        loop {
            match tokio::time::timeout(ping, rx.recv()).await {
                Err(_) => return Some(Frame::data(bytes::Bytes::from_static(b"event: ping\n\n"))),
                Ok(Ok(message)) => {
                    let json = serde_json::to_string(&serde_json::json!({ "message": message }))
                        .unwrap_or_default();
                    let data = format!("event: message.new\ndata: {}\n\n", json);
                    return Some(Frame::data(bytes::Bytes::from(data)));
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                    // Slow client: the poller picks the skipped messages up
                    warn!("SSE client lagged {} messages", n);
                }
                Ok(Err(_)) => return None,
            }
        }
    }
}

impl Drop for SseFeed {
    fn drop(&mut self) {
        // Unsubscribe first so the release sees the real receiver count
        self.rx.take();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let conversation_id = std::mem::take(&mut self.conversation_id);
        runtime.spawn(async move {
            store.release_stream(&conversation_id).await;
        });
    }
}

fn sse_resp(feed: SseFeed, ping: Duration) -> Resp {
    // Comment frame so the client knows the connection is live
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold(feed, move |mut feed| async move {
        let frame = feed.next_frame(ping).await?;
        Some((Ok::<_, Infallible>(frame), feed))
    });

    let stream = first.chain(events);
    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(StreamBody::new(stream).boxed_unsync())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed_unsync()))
}

// ─── Server ──────────────────────────────────────────────────────────────────

struct ServerState {
    store: MessageStore,
    ping_interval: Duration,
}

/// Bound development backend, ready to `run`
pub struct DevServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl DevServer {
    pub async fn bind(config: &DevServerConfig) -> Result<Self> {
        Self::bind_with_store(config, MessageStore::new()).await
    }

    pub async fn bind_with_store(config: &DevServerConfig, store: MessageStore) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await.map_err(ImError::Io)?;
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                store,
                ping_interval: config.ping_interval,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(ImError::Io)
    }

    /// Base URL clients should use
    pub fn base_url(&self) -> Result<String> {
        Ok(format!("http://{}{}", self.local_addr()?, API_PREFIX))
    }

    pub fn store(&self) -> MessageStore {
        self.state.store.clone()
    }

    /// Accept loop; runs until the task is dropped
    pub async fn run(self) -> Result<()> {
        info!("Development IM backend on http://{}{}", self.local_addr()?, API_PREFIX);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Connection from {}", peer);
                    let io = TokioIo::new(stream);
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        let svc = service_fn(move |req| {
                            let state = state.clone();
                            async move { Ok::<_, Infallible>(handle(req, state).await) }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                            // Client-side disconnects are normal for SSE
                            if !e.is_incomplete_message() {
                                error!("Dev backend connection error: {:?}", e);
                            }
                        }
                    });
                }
                Err(e) => error!("Dev backend accept error: {}", e),
            }
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, state: Arc<ServerState>) -> Resp {
    let method = req.method().clone();
    let query = req.uri().query().unwrap_or("").to_string();

    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(bytes::Bytes::new()).boxed_unsync())
            .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed_unsync()));
    }

    let Some(path) = req.uri().path().strip_prefix(API_PREFIX).map(str::to_string) else {
        return json_err(StatusCode::NOT_FOUND, "not found");
    };

    let Some(user_id) = bearer_user(&req) else {
        return json_err(StatusCode::UNAUTHORIZED, "missing bearer token");
    };

    match (method.clone(), path.as_str()) {
        (Method::GET, "/conversations") => list_conversations(&query, &user_id, &state).await,
        (Method::POST, "/conversations/dm") => post_dm(req, &user_id, &state).await,
        (Method::POST, "/conversations/group") => post_group(req, &user_id, &state).await,
        (Method::POST, "/uploads:base64") => post_upload(req, &state).await,
        _ => {
            let Some(rest) = path.strip_prefix("/conversations/") else {
                return json_err(StatusCode::NOT_FOUND, "not found");
            };
            let Some((raw_id, action)) = rest.split_once('/') else {
                return json_err(StatusCode::NOT_FOUND, "not found");
            };
            let conversation_id = urlencoding::decode(raw_id)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| raw_id.to_string());

            if !state.store.exists(&conversation_id).await {
                return json_err(StatusCode::NOT_FOUND, "conversation not found");
            }
            if !state.store.is_member(&conversation_id, &user_id).await {
                return json_err(StatusCode::FORBIDDEN, "FORBIDDEN: not a participant");
            }

            match (method, action) {
                (Method::GET, "history") => get_history(&conversation_id, &query, &state).await,
                (Method::GET, "stream") => get_stream(&conversation_id, &state).await,
                (Method::POST, "messages:sendText") => {
                    post_send_text(req, &conversation_id, &user_id, &state).await
                }
                (Method::POST, "messages:sendFile") => {
                    post_send_file(req, &conversation_id, &user_id, &state).await
                }
                (Method::POST, "read") => post_read(req, &conversation_id, &user_id, &state).await,
                _ => json_err(StatusCode::NOT_FOUND, "not found"),
            }
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn list_conversations(query: &str, user_id: &str, state: &ServerState) -> Resp {
    let kind = match query_param(query, "type").as_deref() {
        None | Some("") => None,
        Some("dm") => Some(ConversationKind::Dm),
        Some("group") => Some(ConversationKind::Group),
        Some(other) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid type {}", other)),
    };
    let filter = ConversationFilter {
        kind,
        hotel_id: query_param(query, "hotel_id"),
    };
    let list = state.store.list(&filter, user_id).await;
    json_ok(&serde_json::json!({ "items": list }))
}

async fn post_dm(req: Request<hyper::body::Incoming>, user_id: &str, state: &ServerState) -> Resp {
    let r: CreateDmRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if r.hotel_id.is_empty() || r.owner_id.is_empty() || r.admin_id.is_empty() {
        return json_err(StatusCode::BAD_REQUEST, "hotel_id, owner_id and admin_id are required");
    }
    let conv = state
        .store
        .upsert_dm(&r.hotel_id, &r.owner_id, &r.admin_id, user_id)
        .await;
    json_ok(&conv)
}

async fn post_group(req: Request<hyper::body::Incoming>, user_id: &str, state: &ServerState) -> Resp {
    let r: CreateGroupRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if r.hotel_id.is_empty() || r.name.trim().is_empty() {
        return json_err(StatusCode::BAD_REQUEST, "hotel_id and name are required");
    }
    json_ok(&state.store.create_group(&r, user_id).await)
}

async fn post_upload(req: Request<hyper::body::Incoming>, state: &ServerState) -> Resp {
    let r: UploadRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.store.save_upload(&r).await {
        Ok(att) => json_ok(&att),
        Err(e) => store_err(e),
    }
}

async fn get_history(conversation_id: &str, query: &str, state: &ServerState) -> Resp {
    let limit = query_param(query, "limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(20)
        .clamp(1, 200);
    let cursor = query_param(query, "cursor").filter(|c| !c.is_empty());
    match state.store.history(conversation_id, limit, cursor.as_deref()).await {
        Ok(page) => json_ok(&page),
        Err(e) => store_err(e),
    }
}

async fn get_stream(conversation_id: &str, state: &ServerState) -> Resp {
    let feed = SseFeed {
        rx: Some(state.store.subscribe(conversation_id).await),
        store: state.store.clone(),
        conversation_id: conversation_id.to_string(),
    };
    sse_resp(feed, state.ping_interval)
}

async fn post_send_text(
    req: Request<hyper::body::Incoming>,
    conversation_id: &str,
    user_id: &str,
    state: &ServerState,
) -> Resp {
    let r: SendTextRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if r.text.trim().is_empty() {
        return json_err(StatusCode::BAD_REQUEST, "text is required");
    }
    let new = NewMessage {
        sender_id: user_id.to_string(),
        sender_role: None,
        kind: MessageKind::Text,
        text: r.text,
        attachments: Vec::new(),
    };
    match state.store.insert_message(conversation_id, new).await {
        Ok(msg) => json_ok(&msg),
        Err(e) => store_err(e),
    }
}

async fn post_send_file(
    req: Request<hyper::body::Incoming>,
    conversation_id: &str,
    user_id: &str,
    state: &ServerState,
) -> Resp {
    let r: SendFileRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if r.attachments.is_empty() {
        return json_err(StatusCode::BAD_REQUEST, "attachments are required");
    }
    let new = NewMessage {
        sender_id: user_id.to_string(),
        sender_role: None,
        kind: MessageKind::File,
        text: r.text,
        attachments: r.attachments,
    };
    match state.store.insert_message(conversation_id, new).await {
        Ok(msg) => json_ok(&msg),
        Err(e) => store_err(e),
    }
}

async fn post_read(
    req: Request<hyper::body::Incoming>,
    conversation_id: &str,
    user_id: &str,
    state: &ServerState,
) -> Resp {
    let r: MarkReadRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    state
        .store
        .mark_read(conversation_id, user_id, &r.last_read_message_id)
        .await;
    json_ok(&serde_json::json!({ "ok": true }))
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn bearer_user(req: &Request<hyper::body::Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

async fn read_json<T: DeserializeOwned>(req: Request<hyper::body::Incoming>) -> std::result::Result<T, Resp> {
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)))
}

fn query_param(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return urlencoding::decode(v).ok().map(|s| s.into_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_decodes() {
        assert_eq!(query_param("limit=5&cursor=a%2Fb", "cursor").as_deref(), Some("a/b"));
        assert_eq!(query_param("limit=5", "cursor"), None);
        assert_eq!(query_param("", "limit"), None);
    }
}
