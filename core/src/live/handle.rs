/// Cancellation handle shared by the stream transport and the poller
use crate::utils::Gate;
use tokio::task::JoinHandle;

/// Owns a background reader. Dropping it cancels the reader.
///
/// Must not be cancelled from inside one of the reader's own callbacks.
#[derive(Debug)]
pub struct LiveHandle {
    gate: Gate,
    task: Option<JoinHandle<()>>,
}

impl LiveHandle {
    pub fn new(gate: Gate, task: Option<JoinHandle<()>>) -> Self {
        Self { gate, task }
    }

    /// Handle with no task behind it, for readers driven from elsewhere
    pub fn detached(gate: Gate) -> Self {
        Self { gate, task: None }
    }

    /// Stop the reader. No callback fires once this returns.
    pub fn cancel(&mut self) {
        self.gate.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Still delivering (not cancelled, not finished)
    pub fn is_active(&self) -> bool {
        self.gate.is_open() && self.task.as_ref().map_or(true, |t| !t.is_finished())
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_aborts_task() {
        let gate = Gate::new();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let mut handle = LiveHandle::new(gate.clone(), Some(task));
        assert!(handle.is_active());

        handle.cancel();
        assert!(!handle.is_active());
        assert!(!gate.is_open());
        handle.cancel();
    }

    #[test]
    fn test_drop_closes_gate() {
        let gate = Gate::new();
        drop(LiveHandle::detached(gate.clone()));
        assert!(!gate.is_open());
    }
}
