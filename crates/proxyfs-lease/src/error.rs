//! Error types for lease operations.

use crate::types::MountId;

/// Errors surfaced by the lease service API.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The named volume is not in the registry.
    #[error("volume '{0}' is not known")]
    VolumeUnknown(String),

    /// The named volume exists but is no longer accepting mounts.
    #[error("volume '{0}' is not accepting mounts")]
    VolumeNotAccepting(String),

    /// The mount has been retired (unmounted, or declared dead after an
    /// interrupt-limit expiry) and must re-register.
    #[error("mount {0} is not registered")]
    MountGone(MountId),

    /// The requested operation is not valid for the caller's current lease
    /// state, or the lifecycle step is out of order.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The request's reply channel went away before a reply was delivered.
    #[error("lease request cancelled")]
    Cancelled,

    /// Shutdown preconditions are not met.
    #[error("cannot shut down: {0}")]
    BusyOnShutdown(String),

    /// A per-inode bookkeeping invariant was violated. Indicates a bug.
    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),
}

/// Result alias for lease operations.
pub type Result<T> = std::result::Result<T, LeaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LeaseError::VolumeUnknown("vol0".to_string());
        assert_eq!(format!("{}", err), "volume 'vol0' is not known");

        let err = LeaseError::BusyOnShutdown("2 volumes still served".to_string());
        assert_eq!(format!("{}", err), "cannot shut down: 2 volumes still served");
    }

    #[test]
    fn test_mount_gone_display_uses_text_form() {
        let id = MountId::generate();
        let err = LeaseError::MountGone(id);
        assert!(format!("{}", err).contains(&id.text()));
    }
}
