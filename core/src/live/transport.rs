/// Stream Transport: one long-lived SSE read per conversation
use crate::config::Config;
use crate::error::{ImError, Result};
use crate::live::handle::LiveHandle;
use crate::live::sse::{classify, SseDecoder};
use crate::messenger_types::{Message, StreamEvent};
use crate::utils::Gate;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Callbacks of a stream. `on_error` fires at most once, after which the
/// transport is finished.
pub trait StreamListener: Send + Sync {
    fn on_message(&self, message: Message);

    fn on_ping(&self) {}

    fn on_error(&self, error: ImError);
}

/// Cancellation handle of an open stream
pub type StreamHandle = LiveHandle;

/// Opens conversation streams
pub trait StreamConnector: Send + Sync {
    fn open(&self, conversation_id: &str, listener: Arc<dyn StreamListener>) -> StreamHandle;
}

/// `StreamConnector` reading `GET /conversations/{id}/stream` over HTTP
#[derive(Clone)]
pub struct SseConnector {
    client: reqwest::Client,
    base_url: String,
    token: String,
    idle_timeout: Duration,
}

impl SseConnector {
    pub fn new(config: &Config) -> Result<Self> {
        // No overall request timeout: the body is meant to stay open
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.clone(),
            token: config.identity.token.clone(),
            idle_timeout: config.stream_idle_timeout,
        })
    }

    pub fn stream_url(&self, conversation_id: &str) -> String {
        format!(
            "{}/conversations/{}/stream",
            self.base_url,
            urlencoding::encode(conversation_id)
        )
    }
}

impl StreamConnector for SseConnector {
    fn open(&self, conversation_id: &str, listener: Arc<dyn StreamListener>) -> StreamHandle {
        let gate = Gate::new();
        let reader = StreamReader {
            client: self.client.clone(),
            url: self.stream_url(conversation_id),
            token: self.token.clone(),
            idle_timeout: self.idle_timeout,
            gate: gate.clone(),
            listener,
        };
        info!("Opening stream for conversation {}", conversation_id);
        let task = tokio::spawn(reader.run());
        StreamHandle::new(gate, Some(task))
    }
}

struct StreamReader {
    client: reqwest::Client,
    url: String,
    token: String,
    idle_timeout: Duration,
    gate: Gate,
    listener: Arc<dyn StreamListener>,
}

impl StreamReader {
    async fn run(self) {
        let error = self.read().await;
        warn!("Stream {} ended: {}", self.url, error);
        let listener = self.listener.clone();
        self.gate.pass(move || listener.on_error(error));
        self.gate.close();
    }

    /// Reads until the connection fails; the returned error is why it stopped
    async fn read(&self) -> ImError {
        let request = self
            .client
            .get(&self.url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send();

        let resp = match timeout(self.idle_timeout, request).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return ImError::Http(e),
            Err(_) => return ImError::Timeout("no response from stream endpoint".to_string()),
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return ImError::Status {
                status: status.as_u16(),
                body,
            };
        }

        let mut body = Box::pin(resp.bytes_stream());
        let mut decoder = SseDecoder::new();
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            let chunk = match timeout_at(deadline, body.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return ImError::Http(e),
                Ok(None) => return ImError::Stream("stream closed by server".to_string()),
                Err(_) => {
                    return ImError::Timeout(format!(
                        "nothing received for {:?}",
                        self.idle_timeout
                    ))
                }
            };

            if !chunk.is_empty() {
                deadline = Instant::now() + self.idle_timeout;
            }
            for frame in decoder.feed(&chunk) {
                self.dispatch(classify(frame));
            }
            if decoder.is_overflowing() {
                return ImError::Stream(format!(
                    "{} bytes without a frame terminator",
                    decoder.pending()
                ));
            }
        }
    }

    fn dispatch(&self, event: std::result::Result<StreamEvent, serde_json::Error>) {
        let listener = &self.listener;
        match event {
            Ok(StreamEvent::Ping) => {
                debug!("ping on {}", self.url);
                self.gate.pass(|| listener.on_ping());
            }
            Ok(StreamEvent::MessageNew(message)) => {
                debug!("message.new {} on {}", message.id, self.url);
                self.gate.pass(move || listener.on_message(message));
            }
            Ok(StreamEvent::Other(name)) => {
                debug!("ignoring SSE event {:?}", name);
            }
            Err(e) => {
                warn!("SSE parse error: {}", e);
            }
        }
    }
}
