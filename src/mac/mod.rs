//! IEEE 802.11p / 1609.4 multi-channel MAC.
//!
//! ## Module Organization
//!
//! - `types`: Access categories, packets, frames and the event enum
//! - `timing`: 802.11p OFDM timing constants and frame duration math
//! - `queue`: Per-access-category FIFO with its contention state
//! - `edca`: EDCA contention engine, one per logical channel
//! - `ack`: ACK timeouts, retry limits and duplicate suppression
//! - `scheduler`: Channel-access scheduler tying it all together
//! - `context`: The trait the MAC uses to reach its clock and radio
//! - `config`: Static configuration loaded from TOML
//! - `error`: Configuration and submission errors

pub mod ack;
pub mod config;
pub mod context;
pub mod edca;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod timing;
pub mod types;

pub use config::MacConfig;
pub use context::{MacContext, TimerHandle};
pub use error::{MacError, SubmitError};
pub use scheduler::Mac;
pub use types::{
    AcParameters, AccessCategory, ChannelKind, Destination, Frame, FrameKind, MacAddress, MacCounters, MacEvent, Packet, PacketId, RadioState, RxFailure,
    TransmitRequest,
};
