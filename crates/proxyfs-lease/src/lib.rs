#![warn(missing_docs)]

//! ProxyFS lease subsystem: per-inode cache-coherence leases for remote
//! mounts, with promote/demote transitions, interrupt-driven revocation,
//! and bulk eviction under memory pressure.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod interrupt;
pub mod manager;
pub mod metrics;
pub mod mount;
pub mod request;
pub mod types;
pub mod volume;

pub use config::LeaseConfig;
pub use error::LeaseError;
pub use manager::LeaseService;
pub use types::{InodeNumber, LeaseInterrupt, LeaseReplyType, LeaseRequestType, MountId};
