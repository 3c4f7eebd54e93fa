// =============================================================================
// Coordinator synchronization primitives
// =============================================================================
//
// Two small wrappers over `tokio::sync::watch`:
//
//   * `PauseGate` — the stream-pause event. The coordinator is the sole
//     setter; any task can wait for it to open. Open means "streaming may
//     proceed"; the coordinator closes it around mid-session provisioning.
//
//   * `Shutdown` — the shared stop signal. Every worker subscribes and exits
//     at its next suspension point once triggered.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;

/// Single-writer, multi-reader pause event.
#[derive(Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    pub fn new(initially_open: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_open);
        Self { tx: Arc::new(tx) }
    }

    /// Allow streaming to proceed.
    pub fn open(&self) {
        let _ = self.tx.send(true);
    }

    /// Block streaming at the next wait point.
    pub fn close(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open. Returns immediately when it already is.
    pub async fn wait_open(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Cooperative stop signal shared by every worker.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Wait until the signal fires.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gate_starts_in_requested_state() {
        assert!(PauseGate::new(true).is_open());
        assert!(!PauseGate::new(false).is_open());
    }

    #[tokio::test]
    async fn wait_open_returns_immediately_when_open() {
        let gate = PauseGate::new(true);
        tokio::time::timeout(std::time::Duration::from_millis(50), gate.wait_open())
            .await
            .expect("open gate must not block");
    }

    #[tokio::test]
    async fn wait_open_blocks_until_opened() {
        let gate = PauseGate::new(false);
        let waiter = gate.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_open().await;
        });
        // Give the waiter a chance to park.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        gate.open();
        tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("waiter must wake")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_wakes_all_subscribers() {
        let shutdown = Shutdown::new();
        let a = shutdown.clone();
        let b = shutdown.clone();
        let ha = tokio::spawn(async move { a.wait().await });
        let hb = tokio::spawn(async move { b.wait().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        shutdown.trigger();
        tokio::time::timeout(std::time::Duration::from_millis(200), async {
            ha.await.unwrap();
            hb.await.unwrap();
        })
        .await
        .expect("subscribers must wake");
        assert!(shutdown.is_triggered());
    }
}
