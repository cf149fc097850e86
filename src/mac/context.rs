//! Boundary between the MAC and whatever drives it.
//!
//! The MAC never owns a clock, a timer wheel or a radio. It reacts to
//! [`MacEvent`]s and talks back through this trait, which the simulation
//! harness implements per node (and the tests implement with a recorder).

use embassy_time::Instant;

use super::types::{MacEvent, Packet, RadioState, TransmitRequest};

/// Opaque handle of a scheduled event. Never reused once the event fired or
/// was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

pub trait MacContext {
    /// Current simulated time.
    fn now(&self) -> Instant;

    /// Deliver `event` back to this MAC at `at` (never in the past).
    fn schedule(&mut self, at: Instant, event: MacEvent) -> TimerHandle;

    /// Cancel a timer that has not fired yet.
    fn cancel(&mut self, handle: TimerHandle);

    /// Put a frame on the air.
    fn transmit(&mut self, request: TransmitRequest);

    fn set_radio_state(&mut self, state: RadioState);

    /// Retune the receiver and transmitter.
    fn tune(&mut self, frequency_hz: f64);

    /// Hand a received packet to the upper layer.
    fn deliver(&mut self, packet: Packet);
}
