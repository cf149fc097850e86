//! MAC error types.
//!
//! Configuration problems are fatal and surface from [`Mac::new`]. Everything
//! that can go wrong at runtime is local to one packet or queue: it is
//! counted, logged and the scheduler carries on.
//!
//! [`Mac::new`]: super::scheduler::Mac::new

use thiserror::Error;

use super::types::AccessCategory;

/// Invalid static configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MacError {
    #[error("bitrate {0} bit/s is not valid for 802.11p; valid rates are 3, 4.5, 6, 9, 12, 18, 24 and 27 Mbit/s")]
    InvalidBitrate(u64),
    #[error("service channel {0} does not exist, must be between 1 and 4")]
    InvalidServiceChannel(u8),
    #[error("invalid parameters for {category:?}: {reason}")]
    InvalidAccessCategory { category: AccessCategory, reason: String },
    #[error("invalid channel timing: {0}")]
    InvalidTiming(String),
    #[error("transmit power {0} mW must be positive and finite")]
    InvalidTxPower(f64),
}

/// Why the MAC refused a packet from the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("{0:?} queue is full, packet dropped")]
    QueueFull(AccessCategory),
    #[error("user priority {0} is outside 0..=7")]
    InvalidPriority(u8),
    #[error("service channel requested but channel switching is disabled")]
    ServiceChannelDisabled,
    #[error("per-packet datarate {0} bit/s is not an 802.11p rate")]
    InvalidDatarate(u64),
}
