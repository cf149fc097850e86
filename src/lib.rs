//! IEEE 802.11p / 1609.4 multi-channel EDCA MAC and a discrete-event harness
//! to run it.

pub mod mac;
pub mod simulation;
pub mod time_driver;
