//! The global lease service.
//!
//! Owns the volume registry, the mount registry, and the service control
//! loop. API handlers call `request` to reach the per-inode coordinators;
//! the control loop handles dead-mount teardown, operation resubmission
//! after a coordinator retires, and bulk eviction sweeps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::MonotonicClock;
use crate::config::{ConfigError, LeaseConfig};
use crate::coordinator::{InodeLeaseCoordinator, LeaseOp};
use crate::error::LeaseError;
use crate::gate::Gate;
use crate::metrics::LeaseMetrics;
use crate::mount::MountRegistry;
use crate::types::{InodeNumber, LeaseInterrupt, LeaseReplyType, LeaseRequestType, MountId};
use crate::volume::Volume;

/// Control messages handled by the service loop.
#[derive(Debug)]
pub(crate) enum ServiceMsg {
    /// A mount was declared dead; sweep its leases and unregister it.
    MountDead(MountId),
    /// An operation raced into a retiring coordinator and must be replayed.
    Resubmit {
        /// Volume the coordinator belonged to.
        volume_name: String,
        /// Inode the operation targets.
        inode_number: InodeNumber,
        /// The operation to replay.
        op: LeaseOp,
    },
    /// Run a bulk eviction pass.
    EvictSweep,
}

/// The lease service singleton. Construct with [`LeaseService::up`]; the
/// gate starts closed and [`LeaseService::signaled_finish`] admits traffic.
pub struct LeaseService {
    config: LeaseConfig,
    clock: MonotonicClock,
    gate: Gate,
    volumes: Mutex<HashMap<String, Arc<Volume>>>,
    registry: Arc<MountRegistry>,
    metrics: Arc<LeaseMetrics>,
    service_tx: mpsc::UnboundedSender<ServiceMsg>,
    service_loop: Mutex<Option<JoinHandle<()>>>,
    evicting: AtomicBool,
}

impl LeaseService {
    /// Brings the service up. Must run inside a tokio runtime; the gate
    /// starts closed, matching a boot sequence that ends with
    /// `signaled_finish`.
    pub fn up(config: LeaseConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let (service_tx, service_rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            config,
            clock: MonotonicClock::new(),
            gate: Gate::new_closed(),
            volumes: Mutex::new(HashMap::new()),
            registry: Arc::new(MountRegistry::new()),
            metrics: Arc::new(LeaseMetrics::new()),
            service_tx,
            service_loop: Mutex::new(None),
            evicting: AtomicBool::new(false),
        });
        let task = tokio::spawn(Self::run_service_loop(
            Arc::downgrade(&service),
            service_rx,
        ));
        *service.service_loop.lock().expect("lock poisoned") = Some(task);
        info!("lease service up");
        Ok(service)
    }

    async fn run_service_loop(
        weak: Weak<LeaseService>,
        mut rx: mpsc::UnboundedReceiver<ServiceMsg>,
    ) {
        while let Some(msg) = rx.recv().await {
            let Some(service) = weak.upgrade() else { break };
            match msg {
                ServiceMsg::MountDead(mount_id) => service.mount_dropped(mount_id).await,
                ServiceMsg::Resubmit {
                    volume_name,
                    inode_number,
                    op,
                } => {
                    match service.volume_named(&volume_name) {
                        Some(volume) => service.submit_op(&volume, inode_number, op).await,
                        // volume torn down meanwhile; the waiter observes
                        // cancellation when the reply channel drops
                        None => debug!(volume = %volume_name, "dropping resubmitted operation"),
                    }
                }
                ServiceMsg::EvictSweep => {
                    service.bulk_evict().await;
                    if service.metrics.live() > service.config.lease_evict_high_limit {
                        // victims may still be inside their minimum lease
                        // duration or mid-revocation; retry after it elapses
                        let tx = service.service_tx.clone();
                        let delay = service.config.min_lease_duration;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(ServiceMsg::EvictSweep);
                        });
                    } else {
                        service.evicting.store(false, Ordering::Release);
                    }
                }
            }
        }
    }

    /// Starts serving a volume. Fails if the name is already served.
    pub fn serve_volume(&self, volume_name: &str) -> Result<(), LeaseError> {
        let mut volumes = self.volumes.lock().expect("lock poisoned");
        if volumes.contains_key(volume_name) {
            return Err(LeaseError::InvalidTransition(format!(
                "volume '{}' is already being served",
                volume_name
            )));
        }
        volumes.insert(volume_name.to_string(), Arc::new(Volume::new(volume_name)));
        info!(volume = volume_name, "serving volume");
        Ok(())
    }

    /// Stops serving a volume: refuses new grants, revokes every lease over
    /// the normal interrupt path, waits for the coordinators to drain, and
    /// removes the volume and its mounts.
    pub async fn unserve_volume(&self, volume_name: &str) -> Result<(), LeaseError> {
        let volume = self
            .volume_named(volume_name)
            .ok_or_else(|| LeaseError::VolumeUnknown(volume_name.to_string()))?;
        volume.stop_accepting_mounts();
        info!(
            volume = volume_name,
            leases = volume.live_coordinator_count(),
            "unserving volume"
        );
        for (_, handle) in volume.snapshot_handles() {
            self.metrics.record_eviction_requested();
            let _ = handle.op_tx.send(LeaseOp::Evict).await;
        }
        volume.wait_coordinators_idle().await;
        for mount_id in volume.mount_ids() {
            self.registry.remove(mount_id);
            volume.remove_mount(mount_id);
        }
        self.volumes
            .lock()
            .expect("lock poisoned")
            .remove(volume_name);
        info!(volume = volume_name, "volume unserved");
        Ok(())
    }

    /// Registers a new mount against a volume, returning its identifier and
    /// the receiving half of its interrupt callback channel.
    pub async fn register_mount(
        &self,
        volume_name: &str,
    ) -> Result<(MountId, mpsc::Receiver<LeaseInterrupt>), LeaseError> {
        let _gate = self.gate.enter().await;
        let volume = self
            .volume_named(volume_name)
            .ok_or_else(|| LeaseError::VolumeUnknown(volume_name.to_string()))?;
        if !volume.is_accepting_mounts() {
            return Err(LeaseError::VolumeNotAccepting(volume_name.to_string()));
        }
        let (mount, callback_rx) = self
            .registry
            .register(volume_name, self.config.callback_channel_capacity);
        volume.add_mount(mount.id());
        info!(volume = volume_name, mount = %mount.id_text(), "mount registered");
        Ok((mount.id(), callback_rx))
    }

    /// Drops a mount without client cooperation: all of its lease requests
    /// are released implicitly. Non-blocking; the sweep runs on the service
    /// loop.
    pub fn drop_mount(&self, mount_id: MountId) -> Result<(), LeaseError> {
        if self.registry.lookup(mount_id).is_none() {
            return Err(LeaseError::MountGone(mount_id));
        }
        self.registry.mark_dead(mount_id);
        let _ = self.service_tx.send(ServiceMsg::MountDead(mount_id));
        Ok(())
    }

    /// The MountDropped sweep: an implicit Release for every inode the mount
    /// holds or waits on, then unregistration. Completes without client
    /// cooperation.
    async fn mount_dropped(&self, mount_id: MountId) {
        let Some(mount) = self.registry.lookup(mount_id) else {
            return;
        };
        let volume = self.volume_named(mount.volume_name());
        let tracked = self.registry.tracked_inodes(mount_id);
        if let Some(volume) = &volume {
            for inode_number in tracked {
                self.submit_op(
                    volume,
                    inode_number,
                    LeaseOp::Request {
                        mount_id,
                        request_type: LeaseRequestType::Release,
                        reply: None,
                    },
                )
                .await;
            }
            volume.remove_mount(mount_id);
        }
        self.registry.remove(mount_id);
        info!(mount = %mount.id_text(), volume = mount.volume_name(), "mount dropped");
    }

    /// Submits a lease request for the mount against an inode. Returns the
    /// reply channel; exactly one reply is delivered on it.
    pub async fn request(
        &self,
        mount_id: MountId,
        inode_number: InodeNumber,
        request_type: LeaseRequestType,
    ) -> Result<oneshot::Receiver<LeaseReplyType>, LeaseError> {
        let _gate = self.gate.enter().await;
        let mount = self
            .registry
            .lookup(mount_id)
            .filter(|m| !m.is_dead())
            .ok_or(LeaseError::MountGone(mount_id))?;
        let volume = self
            .volume_named(mount.volume_name())
            .ok_or_else(|| LeaseError::VolumeUnknown(mount.volume_name().to_string()))?;
        if !volume.is_accepting_mounts() && !request_type.is_ack() {
            return Err(LeaseError::VolumeNotAccepting(volume.name().to_string()));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit_op(
            &volume,
            inode_number,
            LeaseOp::Request {
                mount_id,
                request_type,
                reply: Some(reply_tx),
            },
        )
        .await;
        self.maybe_evict();
        Ok(reply_rx)
    }

    /// Submits a request and waits for its reply.
    pub async fn request_and_wait(
        &self,
        mount_id: MountId,
        inode_number: InodeNumber,
        request_type: LeaseRequestType,
    ) -> Result<LeaseReplyType, LeaseError> {
        let reply_rx = self.request(mount_id, inode_number, request_type).await?;
        reply_rx.await.map_err(|_| LeaseError::Cancelled)
    }

    /// Locates or creates the inode's coordinator and delivers the
    /// operation. A send that loses the race against coordinator retirement
    /// gets the operation handed back and retries against a fresh one.
    async fn submit_op(&self, volume: &Arc<Volume>, inode_number: InodeNumber, mut op: LeaseOp) {
        loop {
            let handle = {
                let mut leases = volume.lock_leases();
                leases
                    .entry(inode_number)
                    .or_insert_with(|| {
                        InodeLeaseCoordinator::start(
                            inode_number,
                            volume.clone(),
                            self.registry.clone(),
                            self.metrics.clone(),
                            self.config.clone(),
                            self.clock,
                            self.service_tx.clone(),
                        )
                    })
                    .clone()
            };
            match handle.op_tx.send(op).await {
                Ok(()) => return,
                Err(err) => op = err.0,
            }
        }
    }

    /// Triggers an eviction sweep when the live-lease count crosses the high
    /// limit and no pass is already in flight.
    fn maybe_evict(&self) {
        if self.metrics.live() > self.config.lease_evict_high_limit
            && !self.evicting.swap(true, Ordering::AcqRel)
        {
            let _ = self.service_tx.send(ServiceMsg::EvictSweep);
        }
    }

    /// One bulk eviction pass: synthetic revokes to the oldest-idle
    /// revocable leases, enough to bring the count down to the low limit.
    async fn bulk_evict(&self) {
        let live = self.metrics.live();
        let target = live.saturating_sub(self.config.lease_evict_low_limit);
        if target == 0 {
            return;
        }
        let mut victims = Vec::new();
        for volume in self.volumes_snapshot() {
            for (inode_number, handle) in volume.snapshot_handles() {
                if handle.info.state().is_evictable() {
                    victims.push((handle.info.last_grant_ms(), inode_number, handle));
                }
            }
        }
        victims.sort_by_key(|(last_grant, inode, _)| (*last_grant, inode.as_u64()));
        if victims.len() < target {
            warn!(
                live,
                target,
                evictable = victims.len(),
                "fewer evictable leases than the eviction target"
            );
        }
        info!(live, target, "bulk eviction pass");
        for (_, _, handle) in victims.into_iter().take(target) {
            self.metrics.record_eviction_requested();
            let _ = handle.op_tx.send(LeaseOp::Evict).await;
        }
    }

    /// Closes the gate for reconfiguration, draining in-flight API requests.
    pub async fn signaled_start(&self) {
        self.gate.close().await;
        info!("api gate closed");
    }

    /// Reopens the gate after reconfiguration (or initial boot).
    pub fn signaled_finish(&self) {
        self.gate.open();
        info!("api gate open");
    }

    /// Shuts the service down. Requires that every volume was unserved and
    /// no mounts or coordinators remain.
    pub fn down(&self) -> Result<(), LeaseError> {
        let volume_count = self.volumes.lock().expect("lock poisoned").len();
        if volume_count != 0 {
            return Err(LeaseError::BusyOnShutdown(format!(
                "{} volumes still served",
                volume_count
            )));
        }
        if !self.registry.is_empty() {
            return Err(LeaseError::BusyOnShutdown(format!(
                "{} mounts still registered",
                self.registry.len()
            )));
        }
        if self.metrics.live() != 0 {
            return Err(LeaseError::BusyOnShutdown(format!(
                "{} lease coordinators still live",
                self.metrics.live()
            )));
        }
        if let Some(task) = self.service_loop.lock().expect("lock poisoned").take() {
            task.abort();
        }
        // leave the gate open so a subsequent up/boot starts clean
        self.gate.open();
        info!("lease service down");
        Ok(())
    }

    /// The service's metrics collector.
    pub fn metrics(&self) -> Arc<LeaseMetrics> {
        self.metrics.clone()
    }

    /// Number of live lease coordinators across all volumes.
    pub fn live_lease_count(&self) -> usize {
        self.metrics.live()
    }

    /// Number of registered mounts.
    pub fn mount_count(&self) -> usize {
        self.registry.len()
    }

    /// Resolves the textual (base64url) form of a mount ID to its byte form.
    pub fn lookup_mount_text(&self, id_text: &str) -> Option<MountId> {
        self.registry.lookup_text(id_text).map(|m| m.id())
    }

    fn volume_named(&self, volume_name: &str) -> Option<Arc<Volume>> {
        self.volumes
            .lock()
            .expect("lock poisoned")
            .get(volume_name)
            .cloned()
    }

    fn volumes_snapshot(&self) -> Vec<Arc<Volume>> {
        self.volumes
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LeaseConfig {
        LeaseConfig {
            min_lease_duration: std::time::Duration::from_millis(40),
            lease_interrupt_interval: std::time::Duration::from_millis(20),
            lease_interrupt_limit: 3,
            ..LeaseConfig::default()
        }
    }

    #[tokio::test]
    async fn test_up_rejects_bad_config() {
        let config = LeaseConfig {
            lease_interrupt_limit: 0,
            ..LeaseConfig::default()
        };
        assert!(LeaseService::up(config).is_err());
    }

    #[tokio::test]
    async fn test_serve_volume_twice_fails() {
        let service = LeaseService::up(test_config()).unwrap();
        service.serve_volume("vol0").unwrap();
        assert!(matches!(
            service.serve_volume("vol0"),
            Err(LeaseError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_register_mount_unknown_volume() {
        let service = LeaseService::up(test_config()).unwrap();
        service.signaled_finish();
        assert!(matches!(
            service.register_mount("nope").await,
            Err(LeaseError::VolumeUnknown(_))
        ));
    }

    #[tokio::test]
    async fn test_request_from_unregistered_mount() {
        let service = LeaseService::up(test_config()).unwrap();
        service.signaled_finish();
        service.serve_volume("vol0").unwrap();
        let result = service
            .request(
                MountId::generate(),
                InodeNumber::new(1),
                LeaseRequestType::RequestShared,
            )
            .await;
        assert!(matches!(result, Err(LeaseError::MountGone(_))));
    }

    #[tokio::test]
    async fn test_drop_unknown_mount() {
        let service = LeaseService::up(test_config()).unwrap();
        assert!(matches!(
            service.drop_mount(MountId::generate()),
            Err(LeaseError::MountGone(_))
        ));
    }

    #[tokio::test]
    async fn test_down_requires_empty_registries() {
        let service = LeaseService::up(test_config()).unwrap();
        service.signaled_finish();
        service.serve_volume("vol0").unwrap();
        assert!(matches!(
            service.down(),
            Err(LeaseError::BusyOnShutdown(_))
        ));

        service.unserve_volume("vol0").await.unwrap();
        service.down().unwrap();
    }

    #[tokio::test]
    async fn test_unserve_unknown_volume() {
        let service = LeaseService::up(test_config()).unwrap();
        assert!(matches!(
            service.unserve_volume("nope").await,
            Err(LeaseError::VolumeUnknown(_))
        ));
    }

    #[tokio::test]
    async fn test_gate_blocks_requests_until_finish() {
        let service = LeaseService::up(test_config()).unwrap();
        service.serve_volume("vol0").unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            service.register_mount("vol0"),
        )
        .await;
        assert!(blocked.is_err(), "gate must hold requests before finish");

        service.signaled_finish();
        service.register_mount("vol0").await.unwrap();
    }

    #[tokio::test]
    async fn test_lookup_mount_by_text_form() {
        let service = LeaseService::up(test_config()).unwrap();
        service.signaled_finish();
        service.serve_volume("vol0").unwrap();
        let (mount_id, _rx) = service.register_mount("vol0").await.unwrap();

        assert_eq!(service.lookup_mount_text(&mount_id.text()), Some(mount_id));
        assert_eq!(service.lookup_mount_text("bogus"), None);
    }

    #[tokio::test]
    async fn test_register_mount_not_accepting() {
        let service = LeaseService::up(test_config()).unwrap();
        service.signaled_finish();
        service.serve_volume("vol0").unwrap();
        let (mount_id, _rx) = service.register_mount("vol0").await.unwrap();

        // tear the volume down, then try to register again
        service.unserve_volume("vol0").await.unwrap();
        assert!(matches!(
            service.register_mount("vol0").await,
            Err(LeaseError::VolumeUnknown(_))
        ));
        // the old mount is gone with its volume
        assert!(matches!(
            service
                .request(mount_id, InodeNumber::new(1), LeaseRequestType::RequestShared)
                .await,
            Err(LeaseError::MountGone(_))
        ));
    }
}
