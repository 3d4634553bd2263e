//! Mount sessions and the mount registry.
//!
//! A mount is one client session against one volume. The registry indexes
//! mounts by both the 16-byte ID and its base64url text form, owns each
//! mount's interrupt callback channel, and tracks which inodes a mount has
//! live lease requests on (the MountDropped sweep walks that set).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{InodeNumber, LeaseInterrupt, MountId};

/// One client mount session.
#[derive(Debug)]
pub struct Mount {
    id: MountId,
    id_text: String,
    volume_name: String,
    callback_tx: mpsc::Sender<LeaseInterrupt>,
    tracked: Mutex<HashSet<InodeNumber>>,
    dead: AtomicBool,
}

impl Mount {
    /// The mount's 16-byte identifier.
    pub fn id(&self) -> MountId {
        self.id
    }

    /// The mount's textual identifier.
    pub fn id_text(&self) -> &str {
        &self.id_text
    }

    /// Name of the volume this mount is attached to.
    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    /// True once the mount has been declared dead (interrupt-limit expiry
    /// or explicit drop). Dead mounts must re-register.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

/// Registry of live mounts, indexed by byte and text identifiers.
#[derive(Debug, Default)]
pub struct MountRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_id: HashMap<MountId, Arc<Mount>>,
    by_text: HashMap<String, Arc<Mount>>,
}

impl MountRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new mount against the named volume. Returns the mount and
    /// the receiving half of its interrupt callback channel.
    pub fn register(
        &self,
        volume_name: &str,
        callback_capacity: usize,
    ) -> (Arc<Mount>, mpsc::Receiver<LeaseInterrupt>) {
        let (callback_tx, callback_rx) = mpsc::channel(callback_capacity);
        let id = MountId::generate();
        let mount = Arc::new(Mount {
            id,
            id_text: id.text(),
            volume_name: volume_name.to_string(),
            callback_tx,
            tracked: Mutex::new(HashSet::new()),
            dead: AtomicBool::new(false),
        });
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.by_id.insert(id, mount.clone());
        inner.by_text.insert(mount.id_text.clone(), mount.clone());
        (mount, callback_rx)
    }

    /// Looks up a mount by its byte identifier.
    pub fn lookup(&self, id: MountId) -> Option<Arc<Mount>> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .by_id
            .get(&id)
            .cloned()
    }

    /// Looks up a mount by its textual identifier.
    pub fn lookup_text(&self, id_text: &str) -> Option<Arc<Mount>> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .by_text
            .get(id_text)
            .cloned()
    }

    /// Removes a mount from both indexes. Returns it if it was present.
    pub fn remove(&self, id: MountId) -> Option<Arc<Mount>> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let mount = inner.by_id.remove(&id)?;
        inner.by_text.remove(&mount.id_text);
        Some(mount)
    }

    /// Number of registered mounts.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").by_id.len()
    }

    /// True when no mounts are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the mount is registered and not dead.
    pub fn is_live(&self, id: MountId) -> bool {
        self.lookup(id).is_some_and(|m| !m.is_dead())
    }

    /// Marks a mount dead. Returns true if this call made it dead.
    pub fn mark_dead(&self, id: MountId) -> bool {
        match self.lookup(id) {
            Some(mount) => mount
                .dead
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    /// Records that a mount has a live lease request on an inode.
    pub fn track(&self, id: MountId, inode_number: InodeNumber) {
        if let Some(mount) = self.lookup(id) {
            mount
                .tracked
                .lock()
                .expect("lock poisoned")
                .insert(inode_number);
        }
    }

    /// Removes an inode from a mount's tracked set.
    pub fn untrack(&self, id: MountId, inode_number: InodeNumber) {
        if let Some(mount) = self.lookup(id) {
            mount
                .tracked
                .lock()
                .expect("lock poisoned")
                .remove(&inode_number);
        }
    }

    /// Snapshot of the inodes a mount has live requests on.
    pub fn tracked_inodes(&self, id: MountId) -> Vec<InodeNumber> {
        match self.lookup(id) {
            Some(mount) => mount
                .tracked
                .lock()
                .expect("lock poisoned")
                .iter()
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Pushes an interrupt onto a mount's callback channel without blocking.
    /// Returns false when the mount is gone, dead, or its channel is full.
    pub fn deliver(&self, id: MountId, interrupt: LeaseInterrupt) -> bool {
        let mount = match self.lookup(id) {
            Some(mount) => mount,
            None => return false,
        };
        if mount.is_dead() {
            return false;
        }
        match mount.callback_tx.try_send(interrupt) {
            Ok(()) => true,
            Err(err) => {
                debug!(mount = %mount.id_text, inode = %interrupt.inode_number,
                       "interrupt callback not delivered: {}", err);
                false
            }
        }
    }
}
