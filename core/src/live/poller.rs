/// Polling Fallback: periodic re-fetch of the newest history page
use crate::api::ImApi;
use crate::live::handle::LiveHandle;
use crate::messenger_types::HistoryPage;
use crate::utils::Gate;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Receives pages whose newest message differs from the last one delivered
pub trait PollListener: Send + Sync {
    fn on_page(&self, page: HistoryPage);
}

/// Handle of a running poller
pub type PollHandle = LiveHandle;

pub struct Poller {
    api: Arc<dyn ImApi>,
    conversation_id: String,
    interval: Duration,
    page_size: usize,
    last_seen: Option<String>,
}

impl Poller {
    pub fn new(
        api: Arc<dyn ImApi>,
        conversation_id: impl Into<String>,
        interval: Duration,
        page_size: usize,
    ) -> Self {
        Self {
            api,
            conversation_id: conversation_id.into(),
            interval,
            page_size,
            last_seen: None,
        }
    }

    /// Fetch once now, then every `interval`.
    ///
    /// Single-flight: each fetch is awaited before the next tick is taken and
    /// missed ticks are skipped, so a slow backend never sees overlapping
    /// requests from one poller.
    pub fn start(self, listener: Arc<dyn PollListener>) -> PollHandle {
        let gate = Gate::new();
        let task = tokio::spawn(self.run(gate.clone(), listener));
        PollHandle::new(gate, Some(task))
    }

    async fn run(mut self, gate: Gate, listener: Arc<dyn PollListener>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !gate.is_open() {
                break;
            }
            if let Some(page) = self.poll_once().await {
                let listener = listener.clone();
                gate.pass(move || listener.on_page(page));
            }
        }
    }

    /// One tick. Returns the page when it carries something new.
    pub async fn poll_once(&mut self) -> Option<HistoryPage> {
        let page = match self
            .api
            .history(&self.conversation_id, self.page_size, None)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!("Poll for conversation {} failed: {}", self.conversation_id, e);
                return None;
            }
        };

        let newest = page.newest_id()?.to_string();
        if self.last_seen.as_deref() == Some(newest.as_str()) {
            return None;
        }

        debug!(
            "Poll for {} found new tail {} ({} messages)",
            self.conversation_id,
            newest,
            page.items.len()
        );
        self.last_seen = Some(newest);
        Some(page)
    }
}
