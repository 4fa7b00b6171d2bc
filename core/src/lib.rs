/// hotelchat - real-time conversation client for the hotel-booking IM backend
///
/// Stream transport (SSE) and polling fallback feed one deduplicated,
/// time-ordered message log per open conversation, owned by the session
/// controller. A development backend serving the same REST + SSE contract
/// is included for local runs and tests.

pub mod api;
pub mod config;
pub mod dev_server;
pub mod error;
pub mod live;
pub mod message_store;
pub mod messenger_types;
pub mod reconciler;
pub mod session;
pub mod utils;

pub use api::{HttpApi, ImApi};
pub use config::{Config, DevServerConfig, Identity};
pub use error::{ImError, Result};
pub use live::{SseConnector, StreamConnector, StreamListener};
pub use reconciler::{merge, MessageLog};
pub use session::{SessionController, SessionSettings, SessionSnapshot, SessionState};
