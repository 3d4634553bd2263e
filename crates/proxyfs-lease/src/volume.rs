//! Served volumes.
//!
//! A volume owns the index from inode number to its lease coordinator and
//! counts live coordinators so teardown can wait for them to drain. Mount
//! objects live in the global registry; the volume only records membership.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::coordinator::CoordinatorHandle;
use crate::types::{InodeNumber, MountId};

/// One served volume.
#[derive(Debug)]
pub struct Volume {
    name: String,
    accepting_mounts: AtomicBool,
    mounts: Mutex<HashSet<MountId>>,
    leases: Mutex<HashMap<InodeNumber, CoordinatorHandle>>,
    live_coordinators: AtomicUsize,
    idle_notify: Notify,
}

impl Volume {
    /// Creates a volume that accepts mounts.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            accepting_mounts: AtomicBool::new(true),
            mounts: Mutex::new(HashSet::new()),
            leases: Mutex::new(HashMap::new()),
            live_coordinators: AtomicUsize::new(0),
            idle_notify: Notify::new(),
        }
    }

    /// The volume's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while the volume accepts new mounts and new lease grants.
    pub fn is_accepting_mounts(&self) -> bool {
        self.accepting_mounts.load(Ordering::Acquire)
    }

    /// Flips the volume out of accepting state (teardown has begun).
    pub fn stop_accepting_mounts(&self) {
        self.accepting_mounts.store(false, Ordering::Release);
    }

    /// Records a mount joining the volume.
    pub fn add_mount(&self, id: MountId) {
        self.mounts.lock().expect("lock poisoned").insert(id);
    }

    /// Records a mount leaving the volume.
    pub fn remove_mount(&self, id: MountId) {
        self.mounts.lock().expect("lock poisoned").remove(&id);
    }

    /// Snapshot of mount membership.
    pub fn mount_ids(&self) -> Vec<MountId> {
        self.mounts
            .lock()
            .expect("lock poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Number of mounts attached to the volume.
    pub fn mount_count(&self) -> usize {
        self.mounts.lock().expect("lock poisoned").len()
    }

    /// Locks the inode-to-coordinator index. Held only for index updates.
    pub(crate) fn lock_leases(&self) -> MutexGuard<'_, HashMap<InodeNumber, CoordinatorHandle>> {
        self.leases.lock().expect("lock poisoned")
    }

    /// Snapshot of the live coordinator handles.
    pub(crate) fn snapshot_handles(&self) -> Vec<(InodeNumber, CoordinatorHandle)> {
        self.lock_leases()
            .iter()
            .map(|(ino, handle)| (*ino, handle.clone()))
            .collect()
    }

    /// Number of live coordinators (the teardown wait condition).
    pub fn live_coordinator_count(&self) -> usize {
        self.live_coordinators.load(Ordering::Acquire)
    }

    /// Accounts for a coordinator coming live.
    pub(crate) fn coordinator_started(&self) {
        self.live_coordinators.fetch_add(1, Ordering::AcqRel);
    }

    /// Accounts for a coordinator retiring; wakes teardown waiters when the
    /// count reaches zero.
    pub(crate) fn coordinator_retired(&self) {
        if self.live_coordinators.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle_notify.notify_waiters();
        }
    }

    /// Waits until no coordinators remain.
    pub async fn wait_coordinators_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            if self.live_coordinator_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_new_volume_accepts_mounts() {
        let volume = Volume::new("vol0");
        assert_eq!(volume.name(), "vol0");
        assert!(volume.is_accepting_mounts());

        volume.stop_accepting_mounts();
        assert!(!volume.is_accepting_mounts());
    }

    #[test]
    fn test_mount_membership() {
        let volume = Volume::new("vol0");
        let m1 = MountId::generate();
        let m2 = MountId::generate();

        volume.add_mount(m1);
        volume.add_mount(m2);
        assert_eq!(volume.mount_count(), 2);

        volume.remove_mount(m1);
        assert_eq!(volume.mount_ids(), vec![m2]);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_idle() {
        let volume = Volume::new("vol0");
        tokio::time::timeout(Duration::from_millis(50), volume.wait_coordinators_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_blocks_until_retired() {
        let volume = Arc::new(Volume::new("vol0"));
        volume.coordinator_started();
        volume.coordinator_started();
        assert_eq!(volume.live_coordinator_count(), 2);

        let waiter = {
            let volume = volume.clone();
            tokio::spawn(async move { volume.wait_coordinators_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        volume.coordinator_retired();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        volume.coordinator_retired();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
