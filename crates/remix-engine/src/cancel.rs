use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Cooperative cancellation flag shared between a batch run and its caller.
///
/// The orchestrator only looks at it between descriptors, so a call that
/// is already streaming finishes on its own terms.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Trips the token from a detached timer thread once `after` elapses.
    pub fn cancel_after(&self, after: Duration) {
        let token = self.clone();
        thread::spawn(move || {
            thread::sleep(after);
            token.cancel();
        });
    }
}
