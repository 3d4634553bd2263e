//! Per-(mount, inode) lease request objects.
//!
//! One LeaseRequest exists for each inode a mount holds or is waiting on.
//! At any instant it sits in exactly one of the coordinator's queues or
//! single-slot roles, and its request state must agree with that placement.

use tokio::sync::oneshot;

use crate::types::{LeaseReplyType, MountId};

/// State of a single mount's interest in one inode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LeaseRequestState {
    /// No interest (transient; a request in this state is being retired).
    None,
    /// Waiting in the requested queue for a shared grant.
    SharedRequested,
    /// Holding a shared lease.
    SharedGranted,
    /// A shared holder waiting for its promotion to exclusive.
    SharedPromoting,
    /// A shared holder that has been asked to release.
    SharedReleasing,
    /// Waiting in the requested queue for an exclusive grant.
    ExclusiveRequested,
    /// Holding the exclusive lease.
    ExclusiveGranted,
    /// The exclusive holder that has been asked to downgrade.
    ExclusiveDemoting,
    /// The exclusive holder that has been asked to release.
    ExclusiveReleasing,
}

impl LeaseRequestState {
    /// Returns a string representation of the request state.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseRequestState::None => "none",
            LeaseRequestState::SharedRequested => "shared-requested",
            LeaseRequestState::SharedGranted => "shared-granted",
            LeaseRequestState::SharedPromoting => "shared-promoting",
            LeaseRequestState::SharedReleasing => "shared-releasing",
            LeaseRequestState::ExclusiveRequested => "exclusive-requested",
            LeaseRequestState::ExclusiveGranted => "exclusive-granted",
            LeaseRequestState::ExclusiveDemoting => "exclusive-demoting",
            LeaseRequestState::ExclusiveReleasing => "exclusive-releasing",
        }
    }
}

/// A mount's live request against one inode.
///
/// Waiters (the requested queue and the promoting slot) carry the deferred
/// reply channel; holders have already been replied to and carry none.
#[derive(Debug)]
pub struct LeaseRequest {
    /// The mount this request belongs to.
    pub mount_id: MountId,
    /// Current request state; must agree with queue placement.
    pub state: LeaseRequestState,
    /// Deferred reply channel, present only while waiting.
    pub reply: Option<oneshot::Sender<LeaseReplyType>>,
}

impl LeaseRequest {
    /// Creates a request in the given state, holding the reply channel if
    /// the reply is deferred.
    pub fn new(
        mount_id: MountId,
        state: LeaseRequestState,
        reply: Option<oneshot::Sender<LeaseReplyType>>,
    ) -> Self {
        Self {
            mount_id,
            state,
            reply,
        }
    }

    /// Delivers the deferred reply, if one is still pending. Delivery to a
    /// dropped receiver is silently discarded.
    pub fn send_reply(&mut self, reply: LeaseReplyType) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(reply);
        }
    }

    /// True when the waiter's reply channel has gone away, meaning the
    /// enclosing request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        match &self.reply {
            Some(tx) => tx.is_closed(),
            None => false,
        }
    }
}
