//! Per-inode lease coordinator.
//!
//! Each inode with lease activity gets one coordinator: a single-consumer
//! actor that owns the holder queues and serializes every state transition.
//! API handlers, timers, and the eviction path talk to it exclusively through
//! its bounded operation channel. Replies are either sent before the next
//! operation is read or parked inside the waiting LeaseRequest until a
//! release or interrupt expiry resolves them.
//!
//! Holder bookkeeping: shared holders and revoked holders live in ordered
//! queues; the promoting, exclusive, and demoting roles are single slots; the
//! requested queue is strictly FIFO. A request occupies exactly one placement
//! at any time and its request state must agree with it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::clock::{self, MonotonicClock, TimerHandle};
use crate::config::LeaseConfig;
use crate::interrupt::{InterruptEpisode, TickVerdict};
use crate::manager::ServiceMsg;
use crate::metrics::LeaseMetrics;
use crate::mount::MountRegistry;
use crate::request::{LeaseRequest, LeaseRequestState};
use crate::types::{InodeNumber, LeaseInterrupt, LeaseReplyType, LeaseRequestType, MountId};
use crate::volume::Volume;

/// State of one inode's lease.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LeaseState {
    /// No lease outstanding.
    None = 0,
    /// Shared lease granted within the minimum lease duration.
    SharedGrantedRecently = 1,
    /// Shared lease granted long enough ago to be revocable.
    SharedGrantedLongAgo = 2,
    /// Shared holders have been asked to release.
    SharedReleasing = 3,
    /// Shared holders failed to release within the interrupt limit.
    SharedExpired = 4,
    /// Exclusive lease granted within the minimum lease duration.
    ExclusiveGrantedRecently = 5,
    /// Exclusive lease granted long enough ago to be revocable.
    ExclusiveGrantedLongAgo = 6,
    /// The exclusive holder has been asked to release.
    ExclusiveReleasing = 7,
    /// The exclusive holder has been asked to downgrade to shared.
    ExclusiveDemoting = 8,
    /// The exclusive holder failed to respond within the interrupt limit.
    ExclusiveExpired = 9,
}

impl LeaseState {
    /// Number of distinct lease states.
    pub const COUNT: usize = 10;

    /// All states, in discriminant order.
    pub const ALL: [LeaseState; LeaseState::COUNT] = [
        LeaseState::None,
        LeaseState::SharedGrantedRecently,
        LeaseState::SharedGrantedLongAgo,
        LeaseState::SharedReleasing,
        LeaseState::SharedExpired,
        LeaseState::ExclusiveGrantedRecently,
        LeaseState::ExclusiveGrantedLongAgo,
        LeaseState::ExclusiveReleasing,
        LeaseState::ExclusiveDemoting,
        LeaseState::ExclusiveExpired,
    ];

    /// Index of this state for counter arrays.
    pub fn as_index(&self) -> usize {
        *self as usize
    }

    /// Returns a string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::None => "none",
            LeaseState::SharedGrantedRecently => "shared-granted-recently",
            LeaseState::SharedGrantedLongAgo => "shared-granted-long-ago",
            LeaseState::SharedReleasing => "shared-releasing",
            LeaseState::SharedExpired => "shared-expired",
            LeaseState::ExclusiveGrantedRecently => "exclusive-granted-recently",
            LeaseState::ExclusiveGrantedLongAgo => "exclusive-granted-long-ago",
            LeaseState::ExclusiveReleasing => "exclusive-releasing",
            LeaseState::ExclusiveDemoting => "exclusive-demoting",
            LeaseState::ExclusiveExpired => "exclusive-expired",
        }
    }

    fn from_u8(value: u8) -> LeaseState {
        LeaseState::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(LeaseState::None)
    }

    /// True for the two states global eviction may target.
    pub fn is_evictable(&self) -> bool {
        matches!(
            self,
            LeaseState::SharedGrantedLongAgo | LeaseState::ExclusiveGrantedLongAgo
        )
    }
}

/// Lock-free view of a coordinator published for the eviction scan.
#[derive(Debug)]
pub struct LeaseInfo {
    state: AtomicU8,
    last_grant_ms: AtomicU64,
}

impl LeaseInfo {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(LeaseState::None as u8),
            last_grant_ms: AtomicU64::new(0),
        }
    }

    /// The coordinator's most recently published state.
    pub fn state(&self) -> LeaseState {
        LeaseState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Milliseconds (service clock) of the most recent grant.
    pub fn last_grant_ms(&self) -> u64 {
        self.last_grant_ms.load(Ordering::Acquire)
    }

    fn set_state(&self, state: LeaseState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_last_grant(&self, ms: u64) {
        self.last_grant_ms.store(ms, Ordering::Release);
    }
}

/// Operation delivered to a coordinator over its request channel.
#[derive(Debug)]
pub(crate) enum LeaseOp {
    /// A mount's request. `reply` is None for synthetic operations issued
    /// during mount teardown.
    Request {
        /// Requesting mount.
        mount_id: MountId,
        /// Requested transition.
        request_type: LeaseRequestType,
        /// Reply channel; exactly one reply per request.
        reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>,
    },
    /// The minimum lease duration elapsed for the grant generation.
    Aged {
        /// Grant generation the age timer was armed for.
        grant_generation: u64,
    },
    /// Interrupt retransmit tick for the given episode generation.
    InterruptTick {
        /// Episode generation the tick belongs to.
        generation: u64,
    },
    /// Synthetic revoke from the eviction or volume-teardown path.
    Evict,
}

/// Cheap cloneable handle to a running coordinator.
#[derive(Clone, Debug)]
pub(crate) struct CoordinatorHandle {
    pub(crate) op_tx: mpsc::Sender<LeaseOp>,
    pub(crate) info: Arc<LeaseInfo>,
}

/// Where a mount's request currently sits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Placement {
    SharedHolder(usize),
    Promoting,
    Exclusive,
    Demoting,
    Releasing(usize),
    Requested(usize),
    Absent,
}

enum RetireOutcome {
    Retired,
    Pending(LeaseOp),
}

/// The per-inode actor.
pub(crate) struct InodeLeaseCoordinator {
    inode_number: InodeNumber,
    volume: Arc<Volume>,
    registry: Arc<MountRegistry>,
    metrics: Arc<LeaseMetrics>,
    config: LeaseConfig,
    clock: MonotonicClock,
    service_tx: mpsc::UnboundedSender<ServiceMsg>,
    op_tx: mpsc::Sender<LeaseOp>,
    info: Arc<LeaseInfo>,

    state: LeaseState,
    shared_holders: VecDeque<LeaseRequest>,
    promoting_holder: Option<LeaseRequest>,
    exclusive_holder: Option<LeaseRequest>,
    demoting_holder: Option<LeaseRequest>,
    releasing_holders: VecDeque<LeaseRequest>,
    requested: VecDeque<LeaseRequest>,

    last_grant_ms: u64,
    grant_generation: u64,
    age_timer: Option<TimerHandle>,
    episode: InterruptEpisode,
    evict_pending: bool,
}

impl InodeLeaseCoordinator {
    /// Spawns a coordinator for the inode and returns its handle. The caller
    /// is responsible for inserting the handle into the volume's lease map;
    /// the coordinator removes itself on retirement.
    pub(crate) fn start(
        inode_number: InodeNumber,
        volume: Arc<Volume>,
        registry: Arc<MountRegistry>,
        metrics: Arc<LeaseMetrics>,
        config: LeaseConfig,
        clock: MonotonicClock,
        service_tx: mpsc::UnboundedSender<ServiceMsg>,
    ) -> CoordinatorHandle {
        let (op_tx, op_rx) = mpsc::channel(config.request_channel_capacity);
        let info = Arc::new(LeaseInfo::new());
        metrics.coordinator_started();
        volume.coordinator_started();
        let coordinator = InodeLeaseCoordinator {
            inode_number,
            volume,
            registry,
            metrics,
            config,
            clock,
            service_tx,
            op_tx: op_tx.clone(),
            info: info.clone(),
            state: LeaseState::None,
            shared_holders: VecDeque::new(),
            promoting_holder: None,
            exclusive_holder: None,
            demoting_holder: None,
            releasing_holders: VecDeque::new(),
            requested: VecDeque::new(),
            last_grant_ms: 0,
            grant_generation: 0,
            age_timer: None,
            episode: InterruptEpisode::new(),
            evict_pending: false,
        };
        tokio::spawn(coordinator.run(op_rx));
        CoordinatorHandle { op_tx, info }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<LeaseOp>) {
        'serve: while let Some(op) = rx.recv().await {
            let mut next = Some(op);
            while let Some(op) = next.take() {
                if self.sweep_cancelled() {
                    self.after_holder_departure();
                }
                self.dispatch(op);
                self.check_invariants();
                if self.state == LeaseState::None {
                    match self.try_retire(&mut rx) {
                        RetireOutcome::Retired => break 'serve,
                        RetireOutcome::Pending(op) => next = Some(op),
                    }
                }
            }
        }
        self.age_timer = None;
        self.episode.cancel();
        self.volume.coordinator_retired();
        self.metrics.coordinator_retired(self.state);
        debug!(inode = %self.inode_number, volume = self.volume.name(), "lease coordinator retired");
    }

    /// Retires only if no operation raced into the channel. Holding the
    /// volume's lease-map lock across the emptiness check makes removal
    /// atomic with respect to new senders; anything that slips into the
    /// buffer afterwards is handed back to the service for resubmission.
    fn try_retire(&mut self, rx: &mut mpsc::Receiver<LeaseOp>) -> RetireOutcome {
        let mut leases = self.volume.lock_leases();
        match rx.try_recv() {
            Ok(op) => RetireOutcome::Pending(op),
            Err(_) => {
                leases.remove(&self.inode_number);
                drop(leases);
                rx.close();
                while let Ok(op) = rx.try_recv() {
                    if matches!(op, LeaseOp::Request { .. }) {
                        let _ = self.service_tx.send(ServiceMsg::Resubmit {
                            volume_name: self.volume.name().to_string(),
                            inode_number: self.inode_number,
                            op,
                        });
                    }
                }
                RetireOutcome::Retired
            }
        }
    }

    fn dispatch(&mut self, op: LeaseOp) {
        match op {
            LeaseOp::Request {
                mount_id,
                request_type,
                reply,
            } => match request_type {
                LeaseRequestType::RequestShared => self.request_shared(mount_id, reply),
                LeaseRequestType::RequestExclusive => self.request_exclusive(mount_id, reply),
                LeaseRequestType::PromoteToExclusive => self.promote(mount_id, reply),
                LeaseRequestType::DemoteToShared => self.demote(mount_id, reply),
                LeaseRequestType::Release => self.release(mount_id, reply),
            },
            LeaseOp::Aged { grant_generation } => self.handle_aged(grant_generation),
            LeaseOp::InterruptTick { generation } => self.handle_interrupt_tick(generation),
            LeaseOp::Evict => self.do_evict(),
        }
    }

    // ---- request handling -------------------------------------------------

    fn request_shared(
        &mut self,
        mount_id: MountId,
        reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>,
    ) {
        if self.placement_of(mount_id) != Placement::Absent || !self.admit_new_request(mount_id) {
            self.deny(reply);
            return;
        }
        match self.state {
            LeaseState::None
            | LeaseState::SharedGrantedRecently
            | LeaseState::SharedGrantedLongAgo => {
                // a queued waiter or pending promotion must not be overtaken
                if self.requested.is_empty() && self.promoting_holder.is_none() {
                    self.grant_shared(mount_id, reply);
                } else {
                    self.enqueue(mount_id, LeaseRequestState::SharedRequested, reply);
                }
            }
            LeaseState::ExclusiveGrantedLongAgo => {
                self.enqueue(mount_id, LeaseRequestState::SharedRequested, reply);
                self.begin_demote_of_exclusive();
            }
            _ => self.enqueue(mount_id, LeaseRequestState::SharedRequested, reply),
        }
    }

    fn request_exclusive(
        &mut self,
        mount_id: MountId,
        reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>,
    ) {
        if self.placement_of(mount_id) != Placement::Absent || !self.admit_new_request(mount_id) {
            self.deny(reply);
            return;
        }
        match self.state {
            LeaseState::None => self.grant_exclusive(mount_id, reply),
            LeaseState::SharedGrantedLongAgo => {
                self.enqueue(mount_id, LeaseRequestState::ExclusiveRequested, reply);
                self.begin_revoke_of_shared();
            }
            LeaseState::ExclusiveGrantedLongAgo => {
                self.enqueue(mount_id, LeaseRequestState::ExclusiveRequested, reply);
                self.begin_revoke_of_exclusive();
            }
            _ => self.enqueue(mount_id, LeaseRequestState::ExclusiveRequested, reply),
        }
    }

    fn promote(
        &mut self,
        mount_id: MountId,
        reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>,
    ) {
        let idx = match self.placement_of(mount_id) {
            Placement::SharedHolder(idx) => idx,
            _ => {
                self.deny(reply);
                return;
            }
        };
        if self.promoting_holder.is_some() || !self.registry.is_live(mount_id) {
            // only one promotion may be outstanding, and only for the living
            self.deny(reply);
            return;
        }
        if !matches!(
            self.state,
            LeaseState::SharedGrantedRecently | LeaseState::SharedGrantedLongAgo
        ) {
            self.deny(reply);
            return;
        }
        if self.shared_holders.len() == 1 {
            // sole holder: promotion needs no revocation
            let mut req = self.shared_holders.remove(idx).expect("indexed holder");
            req.state = LeaseRequestState::ExclusiveGranted;
            self.send_now(reply, LeaseReplyType::Promoted);
            self.exclusive_holder = Some(req);
            self.metrics.record_grant();
            self.record_grant_time(true);
            return;
        }
        let mut req = self.shared_holders.remove(idx).expect("indexed holder");
        req.state = LeaseRequestState::SharedPromoting;
        req.reply = reply;
        self.promoting_holder = Some(req);
        if self.state == LeaseState::SharedGrantedLongAgo {
            self.begin_revoke_of_shared();
        }
        // while SharedGrantedRecently the age timer starts the revocation
    }

    fn demote(
        &mut self,
        mount_id: MountId,
        reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>,
    ) {
        match self.placement_of(mount_id) {
            Placement::Exclusive => {
                let mut req = self.exclusive_holder.take().expect("placement said so");
                req.state = LeaseRequestState::SharedGranted;
                self.shared_holders.push_back(req);
                self.send_now(reply, LeaseReplyType::Demoted);
                self.metrics.record_grant();
                self.record_grant_time(false);
                self.drain_shared_run();
            }
            Placement::Demoting => {
                // the acknowledgment of a demote interrupt
                let mut req = self.demoting_holder.take().expect("placement said so");
                req.state = LeaseRequestState::SharedGranted;
                self.shared_holders.push_back(req);
                self.send_now(reply, LeaseReplyType::Demoted);
                self.episode.cancel();
                self.metrics.record_grant();
                self.record_grant_time(false);
                self.drain_shared_run();
            }
            // duplicate demote from a mount that is already a shared holder
            Placement::SharedHolder(_) => self.send_now(reply, LeaseReplyType::Demoted),
            _ => self.deny(reply),
        }
    }

    fn release(
        &mut self,
        mount_id: MountId,
        reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>,
    ) {
        match self.placement_of(mount_id) {
            Placement::SharedHolder(idx) => {
                let req = self.shared_holders.remove(idx).expect("indexed holder");
                self.finish_release(req, reply);
                self.after_holder_departure();
            }
            Placement::Exclusive => {
                let req = self.exclusive_holder.take().expect("placement said so");
                self.finish_release(req, reply);
                self.after_holder_departure();
            }
            Placement::Demoting => {
                // releasing outright also acknowledges a demote interrupt
                let req = self.demoting_holder.take().expect("placement said so");
                self.finish_release(req, reply);
                self.episode.cancel();
                self.after_holder_departure();
            }
            Placement::Releasing(idx) => {
                let req = self.releasing_holders.remove(idx).expect("indexed holder");
                self.finish_release(req, reply);
                if self.releasing_holders.is_empty() {
                    self.episode.cancel();
                    self.after_holder_departure();
                }
            }
            Placement::Requested(idx) => {
                // the mount abandons its queued request; removal may unblock
                // shared waiters queued behind it
                let mut req = self.requested.remove(idx).expect("indexed waiter");
                req.send_reply(LeaseReplyType::Denied);
                self.metrics.record_denial();
                self.registry.untrack(mount_id, self.inode_number);
                self.send_now(reply, LeaseReplyType::Released);
                self.metrics.record_release();
                self.after_holder_departure();
            }
            Placement::Promoting => {
                let mut req = self.promoting_holder.take().expect("placement said so");
                req.send_reply(LeaseReplyType::Denied);
                self.metrics.record_denial();
                self.finish_release(req, reply);
                self.after_holder_departure();
            }
            Placement::Absent => {
                // duplicate or late acknowledgment: idempotent no-op
                self.send_now(reply, LeaseReplyType::Released);
            }
        }
    }

    fn finish_release(
        &mut self,
        req: LeaseRequest,
        reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>,
    ) {
        self.registry.untrack(req.mount_id, self.inode_number);
        self.send_now(reply, LeaseReplyType::Released);
        self.metrics.record_release();
    }

    // ---- timer handling ---------------------------------------------------

    fn handle_aged(&mut self, grant_generation: u64) {
        if grant_generation != self.grant_generation {
            return; // a newer grant superseded this timer
        }
        match self.state {
            LeaseState::SharedGrantedRecently => {
                self.set_state(LeaseState::SharedGrantedLongAgo);
                if self.evict_pending {
                    self.evict_pending = false;
                    self.do_evict();
                    return;
                }
                self.drop_cancelled_head();
                if self.promoting_holder.is_some() {
                    if self.shared_holders.is_empty() {
                        self.after_holder_departure();
                    } else {
                        self.begin_revoke_of_shared();
                    }
                } else {
                    match self.requested.front().map(|r| r.state) {
                        Some(LeaseRequestState::ExclusiveRequested) => {
                            self.begin_revoke_of_shared()
                        }
                        // stranded behind a since-cancelled exclusive
                        Some(LeaseRequestState::SharedRequested) => self.drain_shared_run(),
                        _ => {}
                    }
                }
            }
            LeaseState::ExclusiveGrantedRecently => {
                self.set_state(LeaseState::ExclusiveGrantedLongAgo);
                if self.evict_pending {
                    self.evict_pending = false;
                    self.do_evict();
                    return;
                }
                self.drop_cancelled_head();
                match self.requested.front().map(|r| r.state) {
                    Some(LeaseRequestState::SharedRequested) => self.begin_demote_of_exclusive(),
                    Some(LeaseRequestState::ExclusiveRequested) => {
                        self.begin_revoke_of_exclusive()
                    }
                    _ => {}
                }
            }
            _ => {} // state moved on; the timer is stale
        }
    }

    fn handle_interrupt_tick(&mut self, generation: u64) {
        match self
            .episode
            .tick(generation, self.config.lease_interrupt_limit)
        {
            TickVerdict::Stale => {}
            TickVerdict::Redeliver => self.deliver_outstanding_interrupts(),
            TickVerdict::Expire => self.expire_episode(),
        }
    }

    /// The interrupt limit was reached: unresponsive holders are dead.
    fn expire_episode(&mut self) {
        self.metrics.record_interrupt_expiry();
        let exclusive_family = matches!(
            self.state,
            LeaseState::ExclusiveReleasing | LeaseState::ExclusiveDemoting
        );
        self.set_state(if exclusive_family {
            LeaseState::ExclusiveExpired
        } else {
            LeaseState::SharedExpired
        });

        let mut dead: Vec<MountId> = Vec::new();
        while let Some(req) = self.releasing_holders.pop_front() {
            dead.push(req.mount_id);
        }
        if let Some(req) = self.demoting_holder.take() {
            dead.push(req.mount_id);
        }
        for mount_id in dead {
            warn!(
                mount = %mount_id,
                inode = %self.inode_number,
                attempts = self.config.lease_interrupt_limit,
                "lease holder unresponsive; declaring mount dead"
            );
            self.registry.untrack(mount_id, self.inode_number);
            if self.registry.mark_dead(mount_id) {
                let _ = self.service_tx.send(ServiceMsg::MountDead(mount_id));
            }
        }
        self.episode.cancel();
        self.after_holder_departure();
    }

    // ---- eviction ---------------------------------------------------------

    /// Synthetic revoke: deny all waiters and drive the lease toward None.
    /// Holders inside their minimum lease duration are evicted when the age
    /// timer fires.
    fn do_evict(&mut self) {
        match self.state {
            LeaseState::None => {}
            LeaseState::SharedGrantedRecently | LeaseState::ExclusiveGrantedRecently => {
                self.deny_all_requested();
                self.deny_promoter();
                self.evict_pending = true;
            }
            LeaseState::SharedGrantedLongAgo => {
                self.deny_all_requested();
                self.deny_promoter();
                if self.shared_holders.is_empty() {
                    self.after_holder_departure();
                } else {
                    self.begin_revoke_of_shared();
                }
            }
            LeaseState::ExclusiveGrantedLongAgo => {
                self.deny_all_requested();
                self.begin_revoke_of_exclusive();
            }
            _ => {
                // a revocation or demotion is already under way; clearing the
                // queue lets it drain to None
                self.deny_all_requested();
                self.deny_promoter();
            }
        }
    }

    fn deny_all_requested(&mut self) {
        while let Some(mut req) = self.requested.pop_front() {
            req.send_reply(LeaseReplyType::Denied);
            self.metrics.record_denial();
            self.registry.untrack(req.mount_id, self.inode_number);
        }
    }

    /// An evicted promoter keeps its shared lease but loses the promotion.
    fn deny_promoter(&mut self) {
        if let Some(mut req) = self.promoting_holder.take() {
            req.send_reply(LeaseReplyType::Denied);
            self.metrics.record_denial();
            req.state = LeaseRequestState::SharedGranted;
            self.shared_holders.push_back(req);
        }
    }

    // ---- grants and resolution --------------------------------------------

    fn grant_shared(
        &mut self,
        mount_id: MountId,
        reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>,
    ) {
        self.registry.track(mount_id, self.inode_number);
        self.send_now(reply, LeaseReplyType::SharedGranted);
        self.shared_holders.push_back(LeaseRequest::new(
            mount_id,
            LeaseRequestState::SharedGranted,
            None,
        ));
        self.metrics.record_grant();
        self.record_grant_time(false);
    }

    fn grant_exclusive(
        &mut self,
        mount_id: MountId,
        reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>,
    ) {
        self.registry.track(mount_id, self.inode_number);
        self.send_now(reply, LeaseReplyType::ExclusiveGranted);
        self.exclusive_holder = Some(LeaseRequest::new(
            mount_id,
            LeaseRequestState::ExclusiveGranted,
            None,
        ));
        self.metrics.record_grant();
        self.record_grant_time(true);
    }

    /// Registers a new (mount, inode) interest and re-checks mount liveness
    /// afterwards. The ordering guarantees that either the dead-mount sweep
    /// observes the tracked inode, or this coordinator observes the death.
    fn admit_new_request(&mut self, mount_id: MountId) -> bool {
        self.registry.track(mount_id, self.inode_number);
        if self.registry.is_live(mount_id) {
            return true;
        }
        self.registry.untrack(mount_id, self.inode_number);
        false
    }

    fn enqueue(
        &mut self,
        mount_id: MountId,
        state: LeaseRequestState,
        reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>,
    ) {
        match reply {
            Some(_) => {
                self.registry.track(mount_id, self.inode_number);
                self.requested
                    .push_back(LeaseRequest::new(mount_id, state, reply));
            }
            // a synthetic operation never waits
            None => self.metrics.record_denial(),
        }
    }

    /// Central resolution after any holder departs: finish the episode if it
    /// is complete, then hand the lease to the promoter, the remaining
    /// shared holders, or the requested queue, in that order.
    fn after_holder_departure(&mut self) {
        if !self.releasing_holders.is_empty() || self.demoting_holder.is_some() {
            return; // interrupts still outstanding
        }
        self.episode.cancel();
        if self.exclusive_holder.is_some() {
            return;
        }
        if self.promoting_holder.is_some() {
            if self.shared_holders.is_empty() {
                let mut req = self.promoting_holder.take().expect("checked above");
                req.state = LeaseRequestState::ExclusiveGranted;
                req.send_reply(LeaseReplyType::Promoted);
                self.exclusive_holder = Some(req);
                self.metrics.record_grant();
                self.record_grant_time(true);
            }
            // otherwise the promoter keeps waiting for the other holders
            return;
        }
        if !self.shared_holders.is_empty() {
            self.restore_shared_granted();
            self.drain_shared_run();
            return;
        }
        self.resolve_requested();
    }

    /// Re-establishes a shared-granted state after an abandoned promotion or
    /// revocation left holders in place.
    fn restore_shared_granted(&mut self) {
        if matches!(
            self.state,
            LeaseState::SharedGrantedRecently | LeaseState::SharedGrantedLongAgo
        ) {
            return;
        }
        let elapsed = self.clock.now_ms().saturating_sub(self.last_grant_ms);
        let min_ms = self.config.min_lease_duration.as_millis() as u64;
        if elapsed >= min_ms {
            self.set_state(LeaseState::SharedGrantedLongAgo);
        } else {
            self.set_state(LeaseState::SharedGrantedRecently);
            let remaining = std::time::Duration::from_millis(min_ms - elapsed);
            let grant_generation = self.grant_generation;
            self.age_timer = Some(clock::one_shot(
                remaining,
                self.op_tx.clone(),
                LeaseOp::Aged { grant_generation },
            ));
        }
    }

    /// Grants the contiguous run of shared waiters at the head of the queue.
    fn drain_shared_run(&mut self) {
        loop {
            self.drop_cancelled_head();
            match self.requested.front().map(|r| r.state) {
                Some(LeaseRequestState::SharedRequested) => {
                    let mut req = self.requested.pop_front().expect("peeked above");
                    req.state = LeaseRequestState::SharedGranted;
                    req.send_reply(LeaseReplyType::SharedGranted);
                    self.shared_holders.push_back(req);
                    self.metrics.record_grant();
                    self.record_grant_time(false);
                }
                _ => break,
            }
        }
    }

    /// Grants from the head of the requested queue once nothing is held.
    fn resolve_requested(&mut self) {
        self.drop_cancelled_head();
        match self.requested.front().map(|r| r.state) {
            Some(LeaseRequestState::ExclusiveRequested) => {
                let mut req = self.requested.pop_front().expect("peeked above");
                req.state = LeaseRequestState::ExclusiveGranted;
                req.send_reply(LeaseReplyType::ExclusiveGranted);
                self.exclusive_holder = Some(req);
                self.metrics.record_grant();
                self.record_grant_time(true);
            }
            Some(LeaseRequestState::SharedRequested) => self.drain_shared_run(),
            _ => self.to_none(),
        }
    }

    fn to_none(&mut self) {
        self.age_timer = None;
        self.episode.cancel();
        self.evict_pending = false;
        self.set_state(LeaseState::None);
    }

    // ---- revocation episodes ----------------------------------------------

    fn begin_revoke_of_shared(&mut self) {
        while let Some(mut req) = self.shared_holders.pop_front() {
            req.state = LeaseRequestState::SharedReleasing;
            self.releasing_holders.push_back(req);
        }
        self.age_timer = None;
        self.set_state(LeaseState::SharedReleasing);
        self.arm_episode();
    }

    fn begin_revoke_of_exclusive(&mut self) {
        let mut req = self.exclusive_holder.take().expect("exclusive holder");
        req.state = LeaseRequestState::ExclusiveReleasing;
        self.releasing_holders.push_back(req);
        self.age_timer = None;
        self.set_state(LeaseState::ExclusiveReleasing);
        self.arm_episode();
    }

    fn begin_demote_of_exclusive(&mut self) {
        let mut req = self.exclusive_holder.take().expect("exclusive holder");
        req.state = LeaseRequestState::ExclusiveDemoting;
        self.demoting_holder = Some(req);
        self.age_timer = None;
        self.set_state(LeaseState::ExclusiveDemoting);
        self.arm_episode();
    }

    fn arm_episode(&mut self) {
        self.episode.arm(
            self.config.lease_interrupt_interval,
            self.op_tx.clone(),
            |generation| LeaseOp::InterruptTick { generation },
        );
        self.deliver_outstanding_interrupts();
    }

    fn deliver_outstanding_interrupts(&self) {
        let generation = self.episode.generation();
        for req in &self.releasing_holders {
            self.deliver_interrupt(req.mount_id, LeaseReplyType::RevokeInterrupt, generation);
        }
        if let Some(req) = &self.demoting_holder {
            self.deliver_interrupt(req.mount_id, LeaseReplyType::DemoteInterrupt, generation);
        }
    }

    fn deliver_interrupt(&self, mount_id: MountId, reply: LeaseReplyType, generation: u64) {
        self.metrics.record_interrupt_sent();
        let delivered = self.registry.deliver(
            mount_id,
            LeaseInterrupt {
                inode_number: self.inode_number,
                generation,
                reply,
            },
        );
        if !delivered {
            self.metrics.record_callback_drop();
        }
    }

    // ---- bookkeeping ------------------------------------------------------

    fn record_grant_time(&mut self, exclusive: bool) {
        self.last_grant_ms = self.clock.now_ms();
        self.info.set_last_grant(self.last_grant_ms);
        self.grant_generation += 1;
        self.set_state(if exclusive {
            LeaseState::ExclusiveGrantedRecently
        } else {
            LeaseState::SharedGrantedRecently
        });
        let grant_generation = self.grant_generation;
        self.age_timer = Some(clock::one_shot(
            self.config.min_lease_duration,
            self.op_tx.clone(),
            LeaseOp::Aged { grant_generation },
        ));
    }

    fn set_state(&mut self, new: LeaseState) {
        if new == self.state {
            return;
        }
        debug!(
            inode = %self.inode_number,
            from = self.state.as_str(),
            to = new.as_str(),
            "lease state transition"
        );
        self.metrics.transition(self.state, new);
        self.state = new;
        self.info.set_state(new);
    }

    fn placement_of(&self, mount_id: MountId) -> Placement {
        if let Some(idx) = self
            .shared_holders
            .iter()
            .position(|r| r.mount_id == mount_id)
        {
            return Placement::SharedHolder(idx);
        }
        if self
            .promoting_holder
            .as_ref()
            .is_some_and(|r| r.mount_id == mount_id)
        {
            return Placement::Promoting;
        }
        if self
            .exclusive_holder
            .as_ref()
            .is_some_and(|r| r.mount_id == mount_id)
        {
            return Placement::Exclusive;
        }
        if self
            .demoting_holder
            .as_ref()
            .is_some_and(|r| r.mount_id == mount_id)
        {
            return Placement::Demoting;
        }
        if let Some(idx) = self
            .releasing_holders
            .iter()
            .position(|r| r.mount_id == mount_id)
        {
            return Placement::Releasing(idx);
        }
        if let Some(idx) = self.requested.iter().position(|r| r.mount_id == mount_id) {
            return Placement::Requested(idx);
        }
        Placement::Absent
    }

    fn send_now(
        &self,
        reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>,
        value: LeaseReplyType,
    ) {
        if let Some(tx) = reply {
            let _ = tx.send(value);
        }
    }

    fn deny(&self, reply: Option<tokio::sync::oneshot::Sender<LeaseReplyType>>) {
        self.metrics.record_denial();
        self.send_now(reply, LeaseReplyType::Denied);
    }

    /// Drops queued waiters whose reply channel went away. A cancelled
    /// promoter reverts to a plain shared holder.
    fn sweep_cancelled(&mut self) -> bool {
        let mut changed = false;
        let mut idx = 0;
        while idx < self.requested.len() {
            if self.requested[idx].is_cancelled() {
                let req = self.requested.remove(idx).expect("indexed waiter");
                self.registry.untrack(req.mount_id, self.inode_number);
                self.metrics.record_cancelled_waiter();
                changed = true;
            } else {
                idx += 1;
            }
        }
        if self
            .promoting_holder
            .as_ref()
            .is_some_and(|r| r.is_cancelled())
        {
            let mut req = self.promoting_holder.take().expect("checked above");
            req.state = LeaseRequestState::SharedGranted;
            req.reply = None;
            self.shared_holders.push_back(req);
            self.metrics.record_cancelled_waiter();
            changed = true;
        }
        changed
    }

    fn drop_cancelled_head(&mut self) {
        while self
            .requested
            .front()
            .is_some_and(|r| r.is_cancelled())
        {
            let req = self.requested.pop_front().expect("peeked above");
            self.registry.untrack(req.mount_id, self.inode_number);
            self.metrics.record_cancelled_waiter();
        }
    }

    // ---- invariants -------------------------------------------------------

    fn invariant(&self, cond: bool, what: &str) {
        if !cond {
            error!(
                inode = %self.inode_number,
                state = self.state.as_str(),
                "lease coordinator invariant violated: {}",
                what
            );
            panic!(
                "lease coordinator invariant violated on inode {}: {}",
                self.inode_number, what
            );
        }
    }

    fn check_invariants(&self) {
        if self.exclusive_holder.is_some() {
            self.invariant(
                self.shared_holders.is_empty() && self.promoting_holder.is_none(),
                "exclusive holder coexists with shared or promoting holders",
            );
        }
        if self.demoting_holder.is_some() {
            self.invariant(
                self.exclusive_holder.is_none()
                    && self.shared_holders.is_empty()
                    && self.promoting_holder.is_none(),
                "demoting holder coexists with other holders",
            );
        }
        match self.state {
            LeaseState::None => self.invariant(
                self.shared_holders.is_empty()
                    && self.promoting_holder.is_none()
                    && self.exclusive_holder.is_none()
                    && self.demoting_holder.is_none()
                    && self.releasing_holders.is_empty()
                    && self.requested.is_empty(),
                "state None with residual requests",
            ),
            LeaseState::SharedGrantedRecently | LeaseState::SharedGrantedLongAgo => self
                .invariant(
                    !self.shared_holders.is_empty()
                        && self.exclusive_holder.is_none()
                        && self.demoting_holder.is_none()
                        && self.releasing_holders.is_empty(),
                    "shared-granted state without matching holders",
                ),
            LeaseState::SharedReleasing | LeaseState::ExclusiveReleasing => self.invariant(
                !self.releasing_holders.is_empty()
                    && self.exclusive_holder.is_none()
                    && self.demoting_holder.is_none(),
                "releasing state without releasing holders",
            ),
            LeaseState::ExclusiveGrantedRecently | LeaseState::ExclusiveGrantedLongAgo => {
                self.invariant(
                    self.exclusive_holder.is_some(),
                    "exclusive-granted state without an exclusive holder",
                )
            }
            LeaseState::ExclusiveDemoting => self.invariant(
                self.demoting_holder.is_some(),
                "demoting state without a demoting holder",
            ),
            LeaseState::SharedExpired | LeaseState::ExclusiveExpired => {
                self.invariant(false, "expired state observed at rest")
            }
        }
        for req in &self.shared_holders {
            self.invariant(
                req.state == LeaseRequestState::SharedGranted,
                "shared holder with mismatched request state",
            );
        }
        for req in &self.releasing_holders {
            self.invariant(
                matches!(
                    req.state,
                    LeaseRequestState::SharedReleasing | LeaseRequestState::ExclusiveReleasing
                ),
                "releasing holder with mismatched request state",
            );
        }
        for req in &self.requested {
            self.invariant(
                matches!(
                    req.state,
                    LeaseRequestState::SharedRequested | LeaseRequestState::ExclusiveRequested
                ),
                "queued waiter with mismatched request state",
            );
        }
        if let Some(req) = &self.promoting_holder {
            self.invariant(
                req.state == LeaseRequestState::SharedPromoting,
                "promoting holder with mismatched request state",
            );
        }
        if let Some(req) = &self.exclusive_holder {
            self.invariant(
                req.state == LeaseRequestState::ExclusiveGranted,
                "exclusive holder with mismatched request state",
            );
        }
        if let Some(req) = &self.demoting_holder {
            self.invariant(
                req.state == LeaseRequestState::ExclusiveDemoting,
                "demoting holder with mismatched request state",
            );
        }
    }
}
