use crate::types::{SnowError, SnowResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Snapshot passed to progress subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Completion in percent, 0 to 100
    pub percent: f64,
    pub message: String,
}

pub type ProgressCallback = Box<dyn Fn(&ProgressUpdate) + Send + Sync>;

#[derive(Debug, Default)]
struct ProgressState {
    percent: f64,
    message: String,
    done: bool,
}

/// Stage progress shared between pipeline workers.
///
/// Increments are additive, so completions may arrive in any order. The
/// total saturates at 100; crossing 99 snaps it to 100 and marks the status
/// message done.
#[derive(Default)]
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback) -> Self {
        Self {
            state: Mutex::new(ProgressState::default()),
            callback: Some(callback),
        }
    }

    pub fn set_callback(&mut self, callback: Option<ProgressCallback>) {
        self.callback = callback;
    }

    /// Add `amount` percent, optionally replacing the status message.
    /// `reset` clears the total first.
    pub fn inc(&self, amount: f64, message: Option<&str>, reset: bool) -> ProgressUpdate {
        let update = {
            let mut state = self.state.lock();
            if reset {
                state.percent = 0.0;
                state.done = false;
            }
            if let Some(msg) = message {
                state.message = msg.to_string();
                state.done = false;
            }
            state.percent = (state.percent + amount).clamp(0.0, 100.0);
            if state.percent >= 99.0 {
                state.percent = 100.0;
                if !state.done {
                    state.message.push_str(" Done!");
                    state.done = true;
                }
            }
            ProgressUpdate {
                percent: state.percent,
                message: state.message.clone(),
            }
        };

        if let Some(callback) = &self.callback {
            callback(&update);
        }
        update
    }

    /// Start a stage: progress back to 1 % with a new message
    pub fn start(&self, message: &str) -> ProgressUpdate {
        self.inc(1.0, Some(message), true)
    }

    pub fn percent(&self) -> f64 {
        self.state.lock().percent
    }

    pub fn message(&self) -> String {
        self.state.lock().message.clone()
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ProgressTracker")
            .field("percent", &state.percent)
            .field("message", &state.message)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Cooperative cancellation flag shared with stage workers
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the next stage can run
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn check(&self) -> SnowResult<()> {
        if self.is_cancelled() {
            Err(SnowError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_progress_saturates() {
        let tracker = ProgressTracker::new();
        tracker.start("Loading images");
        for _ in 0..3 {
            tracker.inc(100.0 / 3.0, None, false);
        }
        assert_eq!(tracker.percent(), 100.0);
        assert_eq!(tracker.message(), "Loading images Done!");

        tracker.inc(50.0, None, false);
        assert_eq!(tracker.percent(), 100.0);
        assert_eq!(tracker.message(), "Loading images Done!");
    }

    #[test]
    fn test_reset_clears_progress() {
        let tracker = ProgressTracker::new();
        tracker.inc(40.0, Some("FFC"), false);
        let update = tracker.inc(5.0, Some("Stitching"), true);
        assert_eq!(update.percent, 5.0);
        assert_eq!(update.message, "Stitching");
    }

    #[test]
    fn test_parallel_increments_are_additive() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tracker = ProgressTracker::with_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        tracker.inc(1.0, None, false);
                    }
                });
            }
        });
        assert_eq!(tracker.percent(), 80.0);
        assert_eq!(calls.load(Ordering::SeqCst), 80);
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        let worker = token.clone();
        assert!(worker.check().is_ok());
        token.cancel();
        assert!(matches!(worker.check(), Err(SnowError::Cancelled)));
        token.reset();
        assert!(!worker.is_cancelled());
    }
}
