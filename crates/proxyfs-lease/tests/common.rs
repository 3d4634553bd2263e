//! Common fixtures for lease integration tests.

use std::sync::Arc;
use std::time::Duration;

use proxyfs_lease::{
    InodeNumber, LeaseConfig, LeaseInterrupt, LeaseReplyType, LeaseRequestType, LeaseService,
    MountId,
};
use tokio::sync::mpsc;

/// Test configuration with short durations for fast testing.
pub fn fast_config() -> LeaseConfig {
    LeaseConfig {
        min_lease_duration: Duration::from_millis(40),
        lease_interrupt_interval: Duration::from_millis(20),
        lease_interrupt_limit: 4,
        ..LeaseConfig::default()
    }
}

/// One registered client session plus its interrupt callback stream.
pub struct TestMount {
    pub id: MountId,
    pub callbacks: mpsc::Receiver<LeaseInterrupt>,
}

impl TestMount {
    /// Waits for the next interrupt callback.
    pub async fn expect_interrupt(&mut self) -> LeaseInterrupt {
        tokio::time::timeout(Duration::from_secs(2), self.callbacks.recv())
            .await
            .expect("timed out waiting for an interrupt")
            .expect("callback channel closed")
    }

    /// True when no interrupt has been delivered so far.
    pub fn no_interrupt_yet(&mut self) -> bool {
        self.callbacks.try_recv().is_err()
    }
}

/// An in-process lease service serving a single test volume.
pub struct TestHarness {
    pub service: Arc<LeaseService>,
    pub volume_name: &'static str,
}

impl TestHarness {
    /// Brings a service up with the fast test configuration.
    pub async fn new() -> Self {
        Self::with_config(fast_config()).await
    }

    /// Brings a service up with the given configuration.
    pub async fn with_config(config: LeaseConfig) -> Self {
        let service = LeaseService::up(config).expect("service up");
        service.serve_volume("volA").expect("serve volume");
        service.signaled_finish();
        Self {
            service,
            volume_name: "volA",
        }
    }

    /// Registers a mount on the test volume.
    pub async fn mount(&self) -> TestMount {
        let (id, callbacks) = self
            .service
            .register_mount(self.volume_name)
            .await
            .expect("register mount");
        TestMount { id, callbacks }
    }

    /// Registers a mount that automatically acknowledges interrupts: a
    /// revoke with Release, a demote with DemoteToShared.
    pub async fn responsive_mount(&self) -> MountId {
        let mount = self.mount().await;
        let id = mount.id;
        let service = self.service.clone();
        let mut callbacks = mount.callbacks;
        tokio::spawn(async move {
            while let Some(interrupt) = callbacks.recv().await {
                let ack = match interrupt.reply {
                    LeaseReplyType::DemoteInterrupt => LeaseRequestType::DemoteToShared,
                    _ => LeaseRequestType::Release,
                };
                // the mount may already be gone during teardown
                let _ = service
                    .request_and_wait(id, interrupt.inode_number, ack)
                    .await;
            }
        });
        id
    }

    /// Submits a request and waits for the reply.
    pub async fn request(
        &self,
        mount_id: MountId,
        inode: u64,
        request_type: LeaseRequestType,
    ) -> LeaseReplyType {
        self.service
            .request_and_wait(mount_id, InodeNumber::new(inode), request_type)
            .await
            .expect("request failed")
    }

    /// Waits until the live-lease count drops to `want` or panics.
    pub async fn wait_for_live(&self, want: usize) {
        for _ in 0..400 {
            if self.service.live_lease_count() <= want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "live lease count stuck at {} (wanted <= {})",
            self.service.live_lease_count(),
            want
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_grants_shared() {
        let harness = TestHarness::new().await;
        let mount = harness.mount().await;
        let reply = harness
            .request(mount.id, 1, LeaseRequestType::RequestShared)
            .await;
        assert_eq!(reply, LeaseReplyType::SharedGranted);
    }

    #[tokio::test]
    async fn test_responsive_mount_acks_revokes() {
        let harness = TestHarness::new().await;
        let m1 = harness.responsive_mount().await;
        let m2 = harness.mount().await;

        let reply = harness.request(m1, 1, LeaseRequestType::RequestShared).await;
        assert_eq!(reply, LeaseReplyType::SharedGranted);

        let reply = harness
            .request(m2.id, 1, LeaseRequestType::RequestExclusive)
            .await;
        assert_eq!(reply, LeaseReplyType::ExclusiveGranted);
    }
}
