/// Live delivery: SSE stream transport and the polling fallback
pub mod handle;
pub mod poller;
pub mod sse;
pub mod transport;

pub use handle::LiveHandle;
pub use poller::{PollHandle, PollListener, Poller};
pub use sse::{SseDecoder, SseFrame};
pub use transport::{SseConnector, StreamConnector, StreamHandle, StreamListener};
