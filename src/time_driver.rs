//! Virtual clock registered as the `embassy-time` driver.
//!
//! The discrete-event loop owns simulated time. It publishes the timestamp of
//! the event being dispatched here, so that anything calling
//! `embassy_time::Instant::now()` (log formatting, mostly) observes simulated
//! time instead of the host clock.
//!
//! A simulation always runs on a single thread, so the clock is kept in
//! thread-local storage. Simulations running on separate threads (parallel
//! test cases, for instance) each see their own timeline.

use core::task::Waker;
use embassy_time::Instant;
use embassy_time_driver::{Driver, time_driver_impl};
use std::cell::Cell;

thread_local! {
    // Virtual "now" in embassy ticks.
    static VIRTUAL_NOW: Cell<u64> = const { Cell::new(0) };
}

/// Rewind the calling thread's clock to zero.
///
/// Called when a new simulation is built so a thread can run several
/// simulations back to back.
pub fn reset() {
    VIRTUAL_NOW.with(|now| now.set(0));
}

/// Advance the calling thread's clock to `instant`.
///
/// Virtual time never moves backwards; a request to rewind is logged and
/// ignored.
pub fn advance_to(instant: Instant) {
    let target = instant.as_ticks();
    let current = VIRTUAL_NOW.with(Cell::get);
    if target < current {
        log::error!("Virtual clock cannot move backwards ({} -> {} ticks)", current, target);
        return;
    }
    VIRTUAL_NOW.with(|now| now.set(target));
}

/// Current virtual time of the calling thread.
pub fn virtual_now() -> Instant {
    Instant::from_ticks(VIRTUAL_NOW.with(Cell::get))
}

struct VirtualClockDriver;

impl Driver for VirtualClockDriver {
    fn now(&self) -> u64 {
        VIRTUAL_NOW.with(Cell::get)
    }

    // Time only moves when the event loop advances it, so nothing can block
    // on an embassy timer. Wake at once and let the caller re-check.
    fn schedule_wake(&self, _at: u64, waker: &Waker) {
        waker.wake_by_ref();
    }
}

// Register as the global time driver for embassy-time
time_driver_impl!(static DRIVER: VirtualClockDriver = VirtualClockDriver);
