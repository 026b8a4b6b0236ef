use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// Shared flag checked before every attempt.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Trips the token from a detached watcher thread once `deadline` elapses.
    ///
    /// # Errors
    /// Returns an error if the watcher thread cannot be spawned.
    pub fn cancel_after(&self, deadline: Duration) -> std::io::Result<()> {
        let token = self.clone();
        std::thread::Builder::new()
            .name("tiergate-deadline".to_string())
            .spawn(move || {
                std::thread::sleep(deadline);
                if !token.is_cancelled() {
                    warn!(deadline_ms = deadline.as_millis(), "run deadline elapsed, cancelling");
                    token.cancel();
                }
            })
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn deadline_watcher_trips_token() {
        let token = CancellationToken::new();
        assert!(token.cancel_after(Duration::from_millis(10)).is_ok());
        let started = std::time::Instant::now();
        while !token.is_cancelled() && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(token.is_cancelled());
    }
}
