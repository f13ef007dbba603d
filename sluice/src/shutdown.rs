//! Cooperative cancellation for long-running loops.
//!
//! A [`ShutdownTrigger`] fans a single stop signal out to any number of
//! [`Shutdown`] handles. Consume and retention loops check their handle
//! before each blocking call and race it against the call itself.
//! Dropping the trigger counts as triggering it.

use tokio::sync::watch;

/// Sending half of a shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half of a shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: Option<watch::Receiver<bool>>,
}

/// Creates a connected trigger/handle pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx: Some(rx) })
}

impl ShutdownTrigger {
    /// Signals every handle to stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns another handle bound to this trigger.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl Shutdown {
    /// A handle that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Returns true once the signal has been sent or the trigger dropped.
    pub fn is_triggered(&self) -> bool {
        match &self.rx {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    /// Completes when the signal is sent or the trigger is dropped.
    pub async fn triggered(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        // wait_for errors only when the sender is gone, which also means stop.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_all_handles() {
        let (trigger, mut first) = channel();
        let mut second = trigger.subscribe();
        assert!(!first.is_triggered());

        trigger.trigger();
        first.triggered().await;
        second.triggered().await;
        assert!(first.is_triggered());
        assert!(second.is_triggered());
    }

    #[tokio::test]
    async fn test_dropping_trigger_stops() {
        let (trigger, mut handle) = channel();
        drop(trigger);
        assert!(handle.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), handle.triggered())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let mut handle = Shutdown::never();
        assert!(!handle.is_triggered());
        let waited = tokio::time::timeout(Duration::from_millis(20), handle.triggered()).await;
        assert!(waited.is_err());
    }
}
