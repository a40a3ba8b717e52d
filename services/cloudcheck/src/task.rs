//! The task a recovery operation runs under.

use keel_id::TaskId;
use tokio::sync::watch;

/// Cancellation signal for the running task.
///
/// Cancelling means "stop advancing": whatever already happened stays done.
#[derive(Debug, Clone)]
pub struct CancelSignal(Option<watch::Receiver<bool>>);

impl CancelSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self(Some(rx))
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self(None)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once the task is cancelled. Pends forever if the sender is
    /// gone without having cancelled.
    pub async fn cancelled(&mut self) {
        let Some(rx) = self.0.as_mut() else {
            return std::future::pending().await;
        };

        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// Identity and cancellation of the task driving an operation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub cancel: CancelSignal,
}

impl TaskContext {
    pub fn new(id: TaskId, cancel: CancelSignal) -> Self {
        Self { id, cancel }
    }

    /// A fresh task that can never be cancelled.
    pub fn detached() -> Self {
        Self::new(TaskId::new(), CancelSignal::never())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancelled_resolves_after_send() {
        let (tx, rx) = watch::channel(false);
        let mut signal = CancelSignal::new(rx);
        assert!(!signal.is_cancelled());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .expect("signal should fire");
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signal_pends() {
        let mut signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_secs(5), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
