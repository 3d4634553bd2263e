//! API gate for reconfiguration quiescence.
//!
//! API operations enter as readers; the reconfiguration path closes the gate
//! as the single writer, draining in-flight readers and holding new ones out
//! until it reopens. The gate serializes nothing among readers.

use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Guard held by an API operation for its duration.
pub type GateGuard = OwnedRwLockReadGuard<()>;

/// Readers-writer gate. Starts closed; `open` admits API traffic.
#[derive(Debug)]
pub struct Gate {
    lock: Arc<RwLock<()>>,
    writer: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
}

impl Gate {
    /// Creates a gate in the closed state.
    pub fn new_closed() -> Self {
        let lock = Arc::new(RwLock::new(()));
        let guard = lock
            .clone()
            .try_write_owned()
            .expect("fresh gate lock is uncontended");
        Self {
            lock,
            writer: Mutex::new(Some(guard)),
        }
    }

    /// Enters the gate as a reader, waiting while it is closed.
    pub async fn enter(&self) -> GateGuard {
        self.lock.clone().read_owned().await
    }

    /// Closes the gate: waits for in-flight readers to drain and then holds
    /// new ones out. A no-op if already closed.
    pub async fn close(&self) {
        if self.writer.lock().expect("lock poisoned").is_some() {
            return;
        }
        let guard = self.lock.clone().write_owned().await;
        *self.writer.lock().expect("lock poisoned") = Some(guard);
    }

    /// Opens the gate, admitting readers. A no-op if already open.
    pub fn open(&self) {
        self.writer.lock().expect("lock poisoned").take();
    }

    /// True while the gate is closed.
    pub fn is_closed(&self) -> bool {
        self.writer.lock().expect("lock poisoned").is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_starts_closed() {
        let gate = Gate::new_closed();
        assert!(gate.is_closed());

        let entered = tokio::time::timeout(Duration::from_millis(50), gate.enter()).await;
        assert!(entered.is_err(), "reader must not pass a closed gate");
    }

    #[tokio::test]
    async fn test_open_admits_readers() {
        let gate = Gate::new_closed();
        gate.open();
        assert!(!gate.is_closed());

        let _a = gate.enter().await;
        let _b = gate.enter().await; // readers do not exclude each other
    }

    #[tokio::test]
    async fn test_close_waits_for_readers() {
        let gate = Arc::new(Gate::new_closed());
        gate.open();

        let guard = gate.enter().await;
        let closer = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.close().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!closer.is_finished(), "close must wait for the reader");

        drop(guard);
        closer.await.unwrap();
        assert!(gate.is_closed());
    }

    #[tokio::test]
    async fn test_reopen_cycle() {
        let gate = Gate::new_closed();
        gate.open();
        let guard = gate.enter().await;
        drop(guard);

        gate.close().await;
        gate.close().await; // idempotent
        assert!(gate.is_closed());

        gate.open();
        gate.open(); // idempotent
        let _g = gate.enter().await;
    }
}
