//! Global pause gate.
//!
//! Background work (health checks, subscription refreshes) parks on
//! `wait_active` while the host application is suspended, so a device waking
//! from background does not fire a burst of stale probes.

use tokio::sync::watch;

pub struct PauseManager {
    tx: watch::Sender<bool>,
}

impl PauseManager {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        PauseManager { tx }
    }

    pub fn pause(&self) {
        let _ = self.tx.send(false);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_active(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves immediately when active, otherwise suspends until `resume`.
    pub async fn wait_active(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for PauseManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_active_passes_when_active() {
        let manager = PauseManager::new();
        tokio::time::timeout(Duration::from_millis(50), manager.wait_active())
            .await
            .expect("active manager must not block");
    }

    #[tokio::test]
    async fn test_wait_active_blocks_until_resume() {
        let manager = Arc::new(PauseManager::new());
        manager.pause();
        assert!(!manager.is_active());

        let waiter = manager.clone();
        let handle = tokio::spawn(async move { waiter.wait_active().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        manager.resume();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("resume must release waiters")
            .unwrap();
    }
}
