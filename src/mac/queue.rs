//! Access-category queue: a bounded FIFO plus its contention state.

use embassy_time::Duration;
use std::collections::VecDeque;

use super::error::SubmitError;
use super::timing::aifs;
use super::types::{AcParameters, AccessCategory, Packet, PacketId};

/// Per-queue EDCA state. Mutated only by the contention engine and the
/// retry controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentionState {
    /// Remaining backoff slots, always within `[0, cw_cur]`.
    pub current_backoff: u32,
    /// Current contention window, always within `[cw_min, cw_max]`.
    pub cw_cur: u32,
    /// Transmit opportunity granted at the last contention resolution.
    pub txop: bool,
    pub short_retry_count: u32,
    pub long_retry_count: u32,
    /// Packet id the queue is head-of-line blocked on.
    pub awaiting_ack: Option<PacketId>,
}

#[derive(Debug, Clone)]
pub struct AcQueue {
    category: AccessCategory,
    params: AcParameters,
    /// Maximum queued packets; 0 means unbounded.
    capacity: usize,
    packets: VecDeque<Packet>,
    state: ContentionState,
}

impl AcQueue {
    pub fn new(category: AccessCategory, params: AcParameters, capacity: usize) -> Self {
        Self {
            category,
            params,
            capacity,
            packets: VecDeque::new(),
            state: ContentionState {
                current_backoff: 0,
                cw_cur: params.cw_min,
                txop: false,
                short_retry_count: 0,
                long_retry_count: 0,
                awaiting_ack: None,
            },
        }
    }

    pub fn category(&self) -> AccessCategory {
        self.category
    }

    pub fn params(&self) -> AcParameters {
        self.params
    }

    pub fn state(&self) -> &ContentionState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ContentionState {
        &mut self.state
    }

    pub fn aifs(&self) -> Duration {
        aifs(self.params.aifsn)
    }

    /// Append a packet. Returns its 1-based position, or `QueueFull` when the
    /// queue is at capacity (the newcomer is the one dropped).
    pub fn push(&mut self, packet: Packet) -> Result<usize, SubmitError> {
        if self.capacity != 0 && self.packets.len() >= self.capacity {
            return Err(SubmitError::QueueFull(self.category));
        }
        self.packets.push_back(packet);
        Ok(self.packets.len())
    }

    pub fn front(&self) -> Option<&Packet> {
        self.packets.front()
    }

    pub fn pop_front(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_blocked(&self) -> bool {
        self.state.awaiting_ack.is_some()
    }

    /// Non-empty and free to contend.
    pub fn is_contending(&self) -> bool {
        !self.is_empty() && !self.is_blocked()
    }

    /// Grow the contention window after a failed or lost contention.
    pub fn grow_window(&mut self) {
        self.state.cw_cur = (self.state.cw_cur * 2 + 1).min(self.params.cw_max);
    }

    pub fn reset_window(&mut self) {
        self.state.cw_cur = self.params.cw_min;
    }

    pub fn reset_retries(&mut self) {
        self.state.short_retry_count = 0;
        self.state.long_retry_count = 0;
    }

    pub fn block_on(&mut self, packet_id: PacketId) {
        self.state.awaiting_ack = Some(packet_id);
    }

    pub fn unblock(&mut self) {
        self.state.awaiting_ack = None;
    }

    /// Drop every queued packet, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.packets.len();
        self.packets.clear();
        count
    }

    pub(crate) fn bounds_hold(&self) -> bool {
        self.state.current_backoff <= self.state.cw_cur && self.state.cw_cur >= self.params.cw_min && self.state.cw_cur <= self.params.cw_max
    }
}
