/// Dispatch gate shared by a background reader and its cancel handle
use std::sync::{Arc, Mutex};

/// Callbacks run while the gate lock is held and `close()` takes the same
/// lock, so once `close()` returns no callback is running or will run.
/// Closing a gate from inside one of its own callbacks deadlocks.
#[derive(Debug, Clone)]
pub struct Gate {
    open: Arc<Mutex<bool>>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            open: Arc::new(Mutex::new(true)),
        }
    }

    /// Run `f` if the gate is still open. Returns false when it was closed.
    pub fn pass<F: FnOnce()>(&self, f: F) -> bool {
        let guard = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if *guard {
            f();
            true
        } else {
            false
        }
    }

    pub fn close(&self) {
        *self.open.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
