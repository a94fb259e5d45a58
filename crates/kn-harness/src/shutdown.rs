use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// StopSignal - cooperative cancellation for a pipeline run
// ---------------------------------------------------------------------------

/// Cloneable stop flag shared between a running pipeline and its controller.
///
/// The pipeline races its work against [`StopSignal::cancelled`]; the
/// controller calls [`StopSignal::trigger`].
///
/// ```ignore
/// let stop = StopSignal::new();
/// tokio::select! {
///     _ = stop.cancelled() => { /* stopped */ }
///     _ = run_pipeline() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Check if a stop has been requested (non-blocking).
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Request a stop. Repeated calls are no-ops.
    pub fn trigger(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("stop signal triggered");
            self.tx.send_replace(true);
        } else {
            warn!("stop already triggered");
        }
    }

    /// Resolve once a stop has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of `self`, so this cannot
        // observe a closed channel while we hold `self`.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn new_signal_is_not_stopped() {
        assert!(!StopSignal::new().is_stopped());
    }

    #[test]
    fn double_trigger_is_idempotent() {
        let signal = StopSignal::new();
        signal.trigger();
        signal.trigger();
        assert!(signal.is_stopped());
    }

    #[test]
    fn clone_shares_state() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        signal.trigger();
        assert!(clone.is_stopped());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_trigger() {
        let signal = StopSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();

        let result = tokio::time::timeout(Duration::from_millis(200), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_stopped() {
        let signal = StopSignal::new();
        signal.trigger();
        let result = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancelled_pends_without_trigger() {
        let signal = StopSignal::new();
        let result = tokio::time::timeout(Duration::from_millis(30), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
