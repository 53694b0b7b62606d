//! A cross-thread cancellation signal.
//!
//! Every long-running worker carries a [`CancellationToken`] derived from the
//! supervisor's root token. Cancelling a parent cancels every child; there is
//! no way to cancel a child without cancelling its ancestors' shared state,
//! since a child token shares the same flag.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Cheap to clone; all clones observe the same underlying signal.
#[derive(Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Idempotent; cancelling twice is a no-op the second time.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Block the current thread until cancelled or `timeout` elapses.
    /// Returns `true` if cancellation occurred within the window.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let mut rx = self.rx.clone();
        // watch::Receiver::changed() is async; a current-thread runtime lets
        // every blocking caller wait on it without pulling in a full executor.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("build current-thread runtime");
        runtime.block_on(async {
            let _ = tokio::time::timeout(timeout, rx.changed()).await;
        });
        self.is_cancelled()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn starts_uncancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_observed_by_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn wait_for_returns_true_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(token.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn wait_for_times_out_when_never_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.wait_for(Duration::from_millis(20)));
    }

    #[test]
    fn wait_for_wakes_on_cancel_from_another_thread() {
        let token = CancellationToken::new();
        let signaller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.cancel();
        });
        assert!(token.wait_for(Duration::from_secs(2)));
        handle.join().expect("join");
    }
}
