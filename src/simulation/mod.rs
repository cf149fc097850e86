//! Discrete-event network simulation.
//!
//! Drives a set of [`Mac`](crate::mac::Mac) instances over an ideal shared
//! medium, feeding them periodic traffic described by a scenario file.
//!
//! ## Module Organization
//!
//! - `scenario`: Scenario file format and validation
//! - `event_queue`: Time-ordered queue with cancellable handles
//! - `medium`: Ideal broadcast medium with collision detection
//! - `network`: The event loop and per-node MAC context
//!
//! ## Public API
//!
//! Load a scenario with [`load_scenario`], build a [`Network`] and call
//! [`Network::run`] to get a [`SimulationReport`].

pub mod event_queue;
pub mod medium;
pub mod network;
pub mod scenario;

pub use network::{Network, NodeReport, SimulationReport};
pub use scenario::{Scenario, load_scenario};
