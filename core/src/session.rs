/// Conversation Session Controller
///
/// Owns which conversation is live. Starting a session bumps a monotonic
/// token, stops the previous stream and poller, and wires fresh ones into
/// one `MessageLog`. Every callback carries the token it was created with and
/// is dropped if that token is no longer current.
///
/// Lock order: the state lock is never held while a `LiveHandle` is dropped
/// or cancelled, because transport callbacks take the handle's gate first
/// and the state lock second.
use crate::api::ImApi;
use crate::config::Identity;
use crate::error::{ImError, Result};
use crate::live::{PollHandle, PollListener, Poller, StreamConnector, StreamHandle, StreamListener};
use crate::messenger_types::{
    Attachment, Conversation, CreateDmRequest, HistoryPage, MarkReadRequest, Message,
    SendFileRequest, SendTextRequest,
};
use crate::reconciler::MessageLog;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Tunables of the controller (see `Config::session_settings`)
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub page_size: usize,
    pub stream_reconnect_delay: Option<Duration>,
    pub default_admin_id: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            page_size: 30,
            stream_reconnect_delay: Some(Duration::from_secs(3)),
            default_admin_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active { conversation_id: String },
}

/// Published after every merge that changed the message list
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub conversation_id: Option<String>,
    /// Deduplicated, ascending by `created_at`
    pub messages: Arc<Vec<Message>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OlderCursor {
    /// No page seen yet
    Unknown,
    More(String),
    Exhausted,
}

struct Active {
    conversation_id: String,
    stream: Option<StreamHandle>,
    poller: Option<PollHandle>,
    older: OlderCursor,
}

struct State {
    token: u64,
    active: Option<Active>,
    log: MessageLog,
}

struct Shared {
    state: Mutex<State>,
    snapshots: watch::Sender<SessionSnapshot>,
    api: Arc<dyn ImApi>,
    connector: Arc<dyn StreamConnector>,
    settings: SessionSettings,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &State) {
        self.snapshots.send_replace(SessionSnapshot {
            conversation_id: state.active.as_ref().map(|a| a.conversation_id.clone()),
            messages: Arc::new(state.log.snapshot()),
        });
    }

    /// Merge messages observed by session `token` (one snapshot per call)
    fn absorb(&self, token: u64, messages: &[Message], cursor: Option<Option<String>>) {
        let mut state = self.lock();
        if state.token != token || state.active.is_none() {
            debug!("Discarding {} message(s) from stale session {}", messages.len(), token);
            return;
        }

        if let (Some(cursor), Some(active)) = (cursor, state.active.as_mut()) {
            if active.older == OlderCursor::Unknown {
                active.older = match cursor {
                    Some(c) => OlderCursor::More(c),
                    None => OlderCursor::Exhausted,
                };
            }
        }

        let added = state.log.extend(messages);
        if added > 0 {
            debug!("Session {}: merged {} new message(s)", token, added);
            self.publish(&state);
        }
    }

    fn stream_failed(self: &Arc<Self>, token: u64, error: ImError) {
        if self.lock().token != token {
            return;
        }
        warn!("Stream for session {} failed, polling continues: {}", token, error);

        let Some(delay) = self.settings.stream_reconnect_delay else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, stream for session {} stays closed", token);
            return;
        };
        let weak = Arc::downgrade(self);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.reopen_stream(token);
            }
        });
    }

    fn reopen_stream(self: &Arc<Self>, token: u64) {
        let (conversation_id, old) = {
            let mut state = self.lock();
            if state.token != token {
                return;
            }
            let Some(active) = state.active.as_mut() else {
                return;
            };
            (active.conversation_id.clone(), active.stream.take())
        };
        drop(old);

        info!("Reopening stream for conversation {} (session {})", conversation_id, token);
        let handle = self.connector.open(&conversation_id, self.feed(token));

        let stale = {
            let mut state = self.lock();
            let current = state.token == token;
            match state.active.as_mut() {
                Some(active) if current => {
                    active.stream = Some(handle);
                    None
                }
                _ => Some(handle),
            }
        };
        drop(stale);
    }

    fn feed(self: &Arc<Self>, token: u64) -> Arc<SessionFeed> {
        Arc::new(SessionFeed {
            shared: Arc::downgrade(self),
            token,
        })
    }
}

/// Token-guarded sink wired into one session's stream and poller
struct SessionFeed {
    shared: Weak<Shared>,
    token: u64,
}

impl StreamListener for SessionFeed {
    fn on_message(&self, message: Message) {
        if let Some(shared) = self.shared.upgrade() {
            shared.absorb(self.token, std::slice::from_ref(&message), None);
        }
    }

    fn on_ping(&self) {
        debug!("Session {} ping", self.token);
    }

    fn on_error(&self, error: ImError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.stream_failed(self.token, error);
        }
    }
}

impl PollListener for SessionFeed {
    fn on_page(&self, page: HistoryPage) {
        if let Some(shared) = self.shared.upgrade() {
            shared.absorb(self.token, &page.chronological(), Some(page.next_cursor));
        }
    }
}

/// Session controller for one signed-in user
pub struct SessionController {
    shared: Arc<Shared>,
    identity: Identity,
}

impl SessionController {
    pub fn new(
        api: Arc<dyn ImApi>,
        connector: Arc<dyn StreamConnector>,
        identity: Identity,
        settings: SessionSettings,
    ) -> Self {
        let (snapshots, _) = watch::channel(SessionSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    token: 0,
                    active: None,
                    log: MessageLog::new(),
                }),
                snapshots,
                api,
                connector,
                settings,
            }),
            identity,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Stop whatever runs, then stream and poll `conversation_id`
    pub fn start_session(&self, conversation_id: &str) -> Result<()> {
        if conversation_id.trim().is_empty() {
            return Err(ImError::Validation("conversation id is empty".to_string()));
        }

        let (token, previous) = {
            let mut state = self.shared.lock();
            state.token += 1;
            let previous = state.active.replace(Active {
                conversation_id: conversation_id.to_string(),
                stream: None,
                poller: None,
                older: OlderCursor::Unknown,
            });
            state.log.clear();
            self.shared.publish(&state);
            (state.token, previous)
        };
        // Cancels the old stream and poller outside the state lock
        drop(previous);

        info!("Session {} started for conversation {}", token, conversation_id);

        let feed = self.shared.feed(token);
        let stream = self.shared.connector.open(conversation_id, feed.clone());
        let poller = Poller::new(
            self.shared.api.clone(),
            conversation_id,
            self.shared.settings.poll_interval,
            self.shared.settings.page_size,
        )
        .start(feed);

        let stale = {
            let mut state = self.shared.lock();
            let current = state.token == token;
            match state.active.as_mut() {
                Some(active) if current => {
                    active.stream = Some(stream);
                    active.poller = Some(poller);
                    None
                }
                _ => Some((stream, poller)),
            }
        };
        drop(stale);
        Ok(())
    }

    /// Stop stream and poller. Calling it while idle is a no-op.
    pub fn stop_session(&self) {
        let previous = {
            let mut state = self.shared.lock();
            let previous = state.active.take();
            if previous.is_some() {
                state.token += 1;
            }
            previous
        };
        if let Some(previous) = previous {
            info!("Session for conversation {} stopped", previous.conversation_id);
        }
    }

    pub fn state(&self) -> SessionState {
        match &self.shared.lock().active {
            Some(active) => SessionState::Active {
                conversation_id: active.conversation_id.clone(),
            },
            None => SessionState::Idle,
        }
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.shared
            .lock()
            .active
            .as_ref()
            .map(|a| a.conversation_id.clone())
    }

    /// Current merged message list
    pub fn messages(&self) -> Vec<Message> {
        self.shared.lock().log.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// (stream running, poller running) for the active session
    pub fn live_status(&self) -> (bool, bool) {
        let state = self.shared.lock();
        match &state.active {
            Some(active) => (
                active.stream.as_ref().is_some_and(|s| s.is_active()),
                active.poller.as_ref().is_some_and(|p| p.is_active()),
            ),
            None => (false, false),
        }
    }

    fn resolve_conversation(&self, conversation_id: Option<&str>) -> Result<String> {
        match conversation_id {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => self.conversation_id().ok_or(ImError::NoConversation),
        }
    }

    /// Send text as typed (blank text is rejected). The message is not added
    /// locally; it shows up once the stream or the poller observes it.
    pub async fn send_text(&self, conversation_id: Option<&str>, text: &str) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(ImError::Validation("message text is empty".to_string()));
        }
        let conversation_id = self.resolve_conversation(conversation_id)?;
        let req = SendTextRequest {
            conversation_id,
            text: text.to_string(),
        };
        self.shared.api.send_text(&req).await
    }

    /// Send attachments (already uploaded) with optional caption
    pub async fn send_file(
        &self,
        conversation_id: Option<&str>,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<Message> {
        if attachments.is_empty() {
            return Err(ImError::Validation("no attachments to send".to_string()));
        }
        let conversation_id = self.resolve_conversation(conversation_id)?;
        let req = SendFileRequest {
            conversation_id,
            text: text.to_string(),
            attachments,
        };
        self.shared.api.send_file(&req).await
    }

    /// Fetch the page before the oldest known one and merge it.
    /// Returns whether older history remains.
    pub async fn load_older(&self) -> Result<bool> {
        let (token, conversation_id, cursor) = {
            let state = self.shared.lock();
            let active = state.active.as_ref().ok_or(ImError::NoConversation)?;
            let cursor = match &active.older {
                OlderCursor::Exhausted => return Ok(false),
                OlderCursor::More(c) => Some(c.clone()),
                OlderCursor::Unknown => None,
            };
            (state.token, active.conversation_id.clone(), cursor)
        };

        let page = self
            .shared
            .api
            .history(&conversation_id, self.shared.settings.page_size, cursor.as_deref())
            .await?;

        let mut state = self.shared.lock();
        if state.token != token {
            return Ok(false);
        }
        let Some(active) = state.active.as_mut() else {
            return Ok(false);
        };
        active.older = match &page.next_cursor {
            Some(c) => OlderCursor::More(c.clone()),
            None => OlderCursor::Exhausted,
        };
        let more = matches!(active.older, OlderCursor::More(_));
        if state.log.extend(&page.items) > 0 {
            self.shared.publish(&state);
        }
        Ok(more)
    }

    /// Mark the newest observed message read. Returns false when there is none.
    pub async fn mark_read(&self) -> Result<bool> {
        let req = {
            let state = self.shared.lock();
            let active = state.active.as_ref().ok_or(ImError::NoConversation)?;
            match state.log.newest() {
                Some(newest) => MarkReadRequest {
                    conversation_id: active.conversation_id.clone(),
                    last_read_message_id: newest.id.clone(),
                },
                None => return Ok(false),
            }
        };
        self.shared.api.mark_read(&req).await?;
        Ok(true)
    }

    /// Get or create the DM for a hotel. Owner defaults to the signed-in
    /// user, admin to the configured default admin.
    pub async fn create_dm(
        &self,
        hotel_id: &str,
        owner_id: Option<&str>,
        admin_id: Option<&str>,
    ) -> Result<Conversation> {
        let owner_id = owner_id.unwrap_or(self.identity.user_id.as_str());
        let admin_id = admin_id.or(self.shared.settings.default_admin_id.as_deref());

        let (hotel_id, owner_id, admin_id) = match (hotel_id, owner_id, admin_id) {
            (h, o, Some(a)) if !h.is_empty() && !o.is_empty() && !a.is_empty() => (h, o, a),
            _ => {
                return Err(ImError::Validation(
                    "missing hotel_id/owner_id/admin_id".to_string(),
                ))
            }
        };

        self.shared
            .api
            .create_dm(&CreateDmRequest {
                hotel_id: hotel_id.to_string(),
                owner_id: owner_id.to_string(),
                admin_id: admin_id.to_string(),
            })
            .await
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop_session();
    }
}
