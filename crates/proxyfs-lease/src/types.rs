//! Core identifier and protocol types for the lease subsystem.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the number of an inode within a served volume.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeNumber(u64);

impl InodeNumber {
    /// Creates a new InodeNumber from a raw u64 value.
    pub fn new(n: u64) -> Self {
        InodeNumber(n)
    }

    /// Returns the raw u64 value of this inode number.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a mount session with 16 random bytes.
///
/// The textual form is the base64url (unpadded) encoding of those bytes;
/// both forms index the mount registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountId([u8; 16]);

impl MountId {
    /// Generates a fresh random mount ID.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        MountId(bytes)
    }

    /// Constructs a MountId from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        MountId(bytes)
    }

    /// Returns the raw 16 bytes of this mount ID.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns the textual (base64url, unpadded) form of this mount ID.
    pub fn text(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parses the textual form back into a MountId.
    /// Returns None if the input is not 16 base64url-encoded bytes.
    pub fn from_text(text: &str) -> Option<Self> {
        let decoded = URL_SAFE_NO_PAD.decode(text).ok()?;
        let bytes: [u8; 16] = decoded.try_into().ok()?;
        Some(MountId(bytes))
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// Type of operation a mount may request against an inode lease.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseRequestType {
    /// Acquire a shared (read-only caching) lease.
    RequestShared,
    /// Upgrade a held shared lease to exclusive.
    PromoteToExclusive,
    /// Acquire an exclusive (read-write caching) lease.
    RequestExclusive,
    /// Downgrade a held exclusive lease to shared.
    DemoteToShared,
    /// Give up whatever lease or pending request the mount has.
    Release,
}

impl LeaseRequestType {
    /// Returns a string representation of the request type.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseRequestType::RequestShared => "request-shared",
            LeaseRequestType::PromoteToExclusive => "promote-to-exclusive",
            LeaseRequestType::RequestExclusive => "request-exclusive",
            LeaseRequestType::DemoteToShared => "demote-to-shared",
            LeaseRequestType::Release => "release",
        }
    }

    /// Returns true for the acknowledgment operations that must stay
    /// admissible while a volume is being unserved.
    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            LeaseRequestType::Release | LeaseRequestType::DemoteToShared
        )
    }
}

impl fmt::Display for LeaseRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply delivered for a lease request, or pushed to a mount's callback
/// channel for server-initiated interrupts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseReplyType {
    /// The request was rejected (invalid transition, unknown holder, ...).
    Denied,
    /// A shared lease is now held.
    SharedGranted,
    /// An exclusive lease is now held.
    ExclusiveGranted,
    /// A shared lease was upgraded to exclusive.
    Promoted,
    /// An exclusive lease was downgraded to shared.
    Demoted,
    /// The lease or pending request was released.
    Released,
    /// Server asks the holder to release its lease.
    RevokeInterrupt,
    /// Server asks the exclusive holder to downgrade to shared.
    DemoteInterrupt,
}

impl LeaseReplyType {
    /// Returns a string representation of the reply type.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseReplyType::Denied => "denied",
            LeaseReplyType::SharedGranted => "shared-granted",
            LeaseReplyType::ExclusiveGranted => "exclusive-granted",
            LeaseReplyType::Promoted => "promoted",
            LeaseReplyType::Demoted => "demoted",
            LeaseReplyType::Released => "released",
            LeaseReplyType::RevokeInterrupt => "revoke-interrupt",
            LeaseReplyType::DemoteInterrupt => "demote-interrupt",
        }
    }
}

impl fmt::Display for LeaseReplyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-initiated callback asking a mount to release or downgrade a lease.
///
/// Delivered on the callback channel handed out at mount registration.
/// The generation ties a redelivery to its revocation episode; the client
/// acknowledges by submitting a Release or DemoteToShared request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInterrupt {
    /// The inode whose lease is being interrupted.
    pub inode_number: InodeNumber,
    /// Revocation episode this interrupt belongs to.
    pub generation: u64,
    /// Either RevokeInterrupt or DemoteInterrupt.
    pub reply: LeaseReplyType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_number_new_and_as_u64() {
        let ino = InodeNumber::new(7);
        assert_eq!(ino.as_u64(), 7);
        assert_eq!(format!("{}", ino), "7");
    }

    #[test]
    fn test_mount_id_unique() {
        let ids: std::collections::HashSet<_> = (0..100).map(|_| MountId::generate()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_mount_id_text_roundtrip() {
        let id = MountId::generate();
        let text = id.text();
        assert_eq!(MountId::from_text(&text), Some(id));
    }

    #[test]
    fn test_mount_id_text_length() {
        // 16 bytes -> 22 base64url characters, no padding
        let id = MountId::generate();
        assert_eq!(id.text().len(), 22);
        assert!(!id.text().contains('='));
    }

    #[test]
    fn test_mount_id_from_text_rejects_garbage() {
        assert!(MountId::from_text("not base64!!").is_none());
        assert!(MountId::from_text("AAAA").is_none()); // wrong length
        assert!(MountId::from_text("").is_none());
    }

    #[test]
    fn test_request_type_is_ack() {
        assert!(LeaseRequestType::Release.is_ack());
        assert!(LeaseRequestType::DemoteToShared.is_ack());
        assert!(!LeaseRequestType::RequestShared.is_ack());
        assert!(!LeaseRequestType::RequestExclusive.is_ack());
        assert!(!LeaseRequestType::PromoteToExclusive.is_ack());
    }

    #[test]
    fn test_reply_type_as_str_unique() {
        use std::collections::HashSet;
        let strs: HashSet<&str> = [
            LeaseReplyType::Denied,
            LeaseReplyType::SharedGranted,
            LeaseReplyType::ExclusiveGranted,
            LeaseReplyType::Promoted,
            LeaseReplyType::Demoted,
            LeaseReplyType::Released,
            LeaseReplyType::RevokeInterrupt,
            LeaseReplyType::DemoteInterrupt,
        ]
        .iter()
        .map(|r| r.as_str())
        .collect();
        assert_eq!(strs.len(), 8);
    }

    #[test]
    fn test_lease_interrupt_serde_roundtrip() {
        let interrupt = LeaseInterrupt {
            inode_number: InodeNumber::new(17),
            generation: 3,
            reply: LeaseReplyType::RevokeInterrupt,
        };
        let encoded = serde_json::to_string(&interrupt).unwrap();
        let decoded: LeaseInterrupt = serde_json::from_str(&encoded).unwrap();
        assert_eq!(interrupt, decoded);
    }
}
