//! Real-time enable flag
//!
//! Written only by inbound control commands, read by the real-time loop.
//! Last command wins; waiting is event driven and stops on cancellation.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ControlGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ControlGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlGate {
    /// New gate, initially inactive
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Activate; returns whether the state changed
    pub fn set(&self) -> bool {
        let changed = self.tx.send_if_modified(|active| !std::mem::replace(active, true));
        if changed {
            info!("Real-time publishing enabled");
        }
        changed
    }

    /// Deactivate; returns whether the state changed
    pub fn clear(&self) -> bool {
        let changed = self.tx.send_if_modified(|active| std::mem::replace(active, false));
        if changed {
            info!("Real-time publishing disabled");
        }
        changed
    }

    pub fn is_active(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until active
    ///
    /// Returns `true` once the gate is active, `false` if `cancel` fired first.
    pub async fn wait_until_active(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            // The sender lives in self, so this cannot see a closed channel
            result = rx.wait_for(|active| *active) => result.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_last_command_wins() {
        let gate = ControlGate::new();
        assert!(!gate.is_active());

        assert!(gate.set());
        assert!(!gate.set());
        assert!(gate.is_active());

        assert!(gate.clear());
        assert!(!gate.clear());
        assert!(!gate.is_active());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_active() {
        let gate = ControlGate::new();
        gate.set();
        assert!(gate.wait_until_active(&CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_set() {
        let gate = ControlGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_until_active(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.set();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_interrupted_by_cancel() {
        let gate = ControlGate::new();
        let cancel = CancellationToken::new();
        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait_until_active(&cancel).await })
        };

        cancel.cancel();
        assert!(!waiter.await.unwrap());
        assert!(!gate.is_active());
    }
}
