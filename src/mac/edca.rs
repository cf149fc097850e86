//! EDCA contention engine.
//!
//! One engine exists per logical channel. It owns the four access-category
//! queues of that channel and implements the 802.11 backoff procedure on top
//! of the idle/busy notifications relayed by the channel-access scheduler:
//!
//! - `schedule_next_contention` turns "the channel has been idle since T"
//!   into the earliest instant any queue may transmit
//! - `stop_contention` charges the idle time that elapsed against every
//!   queue's backoff when the channel turns busy, and hands out transmit
//!   opportunities to queues that counted down to zero
//! - `initiate_transmit` resolves internal collisions between queues that
//!   were granted an opportunity at the same instant
//!
//! Randomness comes from an RNG injected at construction, so every node and
//! channel draws from an independent, reproducible stream.

use embassy_time::{Duration, Instant};
use log::{debug, error};
use rand::Rng;
use rand::distributions::Uniform;
use rand::rngs::StdRng;

use super::error::SubmitError;
use super::queue::AcQueue;
use super::timing::{SLOT, next_slot_boundary, whole_slots};
use super::types::{AcParameters, AccessCategory, ChannelKind, Packet, PacketId};

/// Backoff statistics of one engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdcaStats {
    pub internal_collisions: u64,
    pub backoffs: u64,
    pub backoff_slots: u64,
}

pub struct EdcaEngine {
    node_id: u32,
    channel: ChannelKind,
    /// Indexed by `AccessCategory::index()`.
    queues: [AcQueue; 4],
    /// Idle reference point of the running contention, if any.
    contention_start: Option<Instant>,
    rng: StdRng,
    stats: EdcaStats,
}

impl EdcaEngine {
    /// Build an engine with one queue per category.
    ///
    /// `params` is indexed by `AccessCategory::index()`.
    pub fn new(node_id: u32, channel: ChannelKind, params: [AcParameters; 4], queue_capacity: usize, rng: StdRng) -> Self {
        let queues = [
            AccessCategory::Background,
            AccessCategory::BestEffort,
            AccessCategory::Video,
            AccessCategory::Voice,
        ]
        .map(|category| AcQueue::new(category, params[category.index()], queue_capacity));
        Self {
            node_id,
            channel,
            queues,
            contention_start: None,
            rng,
            stats: EdcaStats::default(),
        }
    }

    pub fn channel(&self) -> ChannelKind {
        self.channel
    }

    pub fn queue(&self, category: AccessCategory) -> &AcQueue {
        &self.queues[category.index()]
    }

    pub(crate) fn queue_mut(&mut self, category: AccessCategory) -> &mut AcQueue {
        &mut self.queues[category.index()]
    }

    pub fn stats(&self) -> EdcaStats {
        self.stats
    }

    /// Queue a packet. Returns its 1-based position in the category queue.
    pub fn enqueue(&mut self, category: AccessCategory, packet: Packet) -> Result<usize, SubmitError> {
        self.queue_mut(category).push(packet)
    }

    /// Draw a fresh backoff uniformly from `[0, cw_cur]`.
    pub fn draw_backoff(&mut self, category: AccessCategory) -> u32 {
        let cw_cur = self.queue(category).state().cw_cur;
        let backoff = self.rng.sample(Uniform::new_inclusive(0, cw_cur));
        self.queue_mut(category).state_mut().current_backoff = backoff;
        self.stats.backoffs += 1;
        self.stats.backoff_slots += backoff as u64;
        backoff
    }

    /// Earliest instant at which any contending queue may transmit, given the
    /// channel has been idle since `idle_since`.
    ///
    /// `idle_since` may lie in the future when a guard interval pushed the
    /// idle reference point forward.
    pub fn schedule_next_contention(&mut self, now: Instant, idle_since: Instant, guard_active: bool) -> Option<Instant> {
        let idle_time = now.saturating_duration_since(idle_since);
        self.contention_start = Some(idle_since);

        let mut next_event: Option<Instant> = None;
        for category in AccessCategory::BY_PRIORITY {
            if !self.queue(category).is_contending() {
                continue;
            }

            // Never transmit opportunistically right at a channel boundary.
            if guard_active && self.queue(category).state().current_backoff == 0 {
                self.draw_backoff(category);
            }

            let queue = self.queue(category);
            let aifs = queue.aifs();
            let wait = contention_wait(queue);

            let candidate = if idle_time > wait {
                // Could have sent already had the packet been here earlier.
                next_slot_boundary(idle_since + aifs, now)
            } else {
                idle_since + wait
            };

            debug!(
                "[{}] {} {:?}: aifs {} us + {} slots, idle for {} us -> {} us",
                self.node_id,
                self.channel.label(),
                category,
                aifs.as_micros(),
                queue.state().current_backoff,
                idle_time.as_micros(),
                candidate.as_micros()
            );

            next_event = Some(match next_event {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        }
        next_event
    }

    /// Charge the idle period that just ended against every queue's backoff.
    ///
    /// Queues whose backoff ran out get a transmit opportunity when
    /// `generate_txop` is set; otherwise their backoff is only clamped to 0.
    pub fn stop_contention(&mut self, now: Instant, generate_txop: bool) {
        let Some(start) = self.contention_start.take() else {
            return;
        };
        let passed = now.saturating_duration_since(start);

        for queue in self.queues.iter_mut() {
            let backoff = queue.state().current_backoff;
            if backoff == 0 && queue.is_empty() {
                continue;
            }
            let aifs = queue.aifs();
            if passed < aifs {
                // Not even one AIFS elapsed.
                continue;
            }
            let elapsed_slots = 1 + whole_slots(passed - aifs);

            if !queue.is_contending() {
                // Post-transmit backoff of an empty or blocked queue never
                // produces a transmit opportunity.
                queue.state_mut().current_backoff = backoff.saturating_sub(elapsed_slots.min(u32::MAX as u64) as u32);
                continue;
            }

            if elapsed_slots > backoff as u64 {
                if generate_txop {
                    queue.state_mut().txop = true;
                }
                queue.state_mut().current_backoff = 0;
            } else {
                queue.state_mut().current_backoff = backoff - elapsed_slots as u32;
            }
            debug!(
                "[{}] {} {:?}: backoff {} -> {}{}",
                self.node_id,
                self.channel.label(),
                queue.category(),
                backoff,
                queue.state().current_backoff,
                if queue.state().txop { " TXOP" } else { "" }
            );
        }
    }

    /// Pick the queue that transmits now.
    ///
    /// The highest-priority queue holding a transmit opportunity wins; every
    /// other holder suffers an internal collision and backs off with a grown
    /// window.
    pub fn initiate_transmit(&mut self, now: Instant, last_idle: Instant) -> Option<(AccessCategory, Packet)> {
        let idle_time = now.saturating_duration_since(last_idle);
        let mut winner: Option<AccessCategory> = None;

        for category in AccessCategory::BY_PRIORITY {
            let queue = self.queue(category);
            if !queue.is_contending() || !queue.state().txop || idle_time < queue.aifs() {
                continue;
            }
            self.queue_mut(category).state_mut().txop = false;

            if winner.is_none() {
                winner = Some(category);
                continue;
            }

            self.stats.internal_collisions += 1;
            self.queue_mut(category).grow_window();
            let backoff = self.draw_backoff(category);
            debug!(
                "[{}] {} internal collision for {:?}: cw {} backoff {}",
                self.node_id,
                self.channel.label(),
                category,
                self.queue(category).state().cw_cur,
                backoff
            );
        }

        let category = winner?;
        let packet = self.queue(category).front()?.clone();
        Some((category, packet))
    }

    /// Bookkeeping once the winning frame left the radio.
    ///
    /// Frames that need an ACK stay at the head of the queue, which is then
    /// blocked until the ACK arrives or the retry limit is hit. Everything
    /// else is done: pop it, reset the window and enter post-transmit
    /// backoff.
    pub fn post_transmit(&mut self, category: AccessCategory, uses_ack: bool) {
        if uses_ack {
            let Some(packet_id) = self.queue(category).front().map(|p| p.id) else {
                error!("[{}] {} {:?}: transmit completed on an empty queue", self.node_id, self.channel.label(), category);
                return;
            };
            self.queue_mut(category).block_on(packet_id);
            return;
        }
        self.queue_mut(category).pop_front();
        self.finish_head(category);
        debug!(
            "[{}] {} {:?}: post-transmit backoff {} slots",
            self.node_id,
            self.channel.label(),
            category,
            self.queue(category).state().current_backoff
        );
    }

    /// The ACK for `packet_id` arrived. Returns `false` when the category is
    /// not blocked on that packet.
    pub fn acknowledge(&mut self, category: AccessCategory, packet_id: PacketId) -> bool {
        if self.queue(category).state().awaiting_ack != Some(packet_id) {
            return false;
        }
        self.queue_mut(category).pop_front();
        self.finish_head(category);
        true
    }

    /// Common tail of a completed exchange: unblock, reset window and retry
    /// counters, draw the post-transmit backoff.
    pub(crate) fn finish_head(&mut self, category: AccessCategory) {
        let queue = self.queue_mut(category);
        queue.unblock();
        queue.reset_window();
        queue.reset_retries();
        self.draw_backoff(category);
    }

    /// Drop every transmit opportunity that was granted but not used.
    pub fn revoke_txops(&mut self) {
        for queue in self.queues.iter_mut() {
            if queue.state().txop {
                queue.state_mut().txop = false;
                queue.state_mut().current_backoff = 0;
            }
        }
    }

    /// Blocked queue waiting for `packet_id`, if any.
    pub fn blocked_on(&self, packet_id: PacketId) -> Option<AccessCategory> {
        AccessCategory::BY_PRIORITY
            .into_iter()
            .find(|&category| self.queue(category).state().awaiting_ack == Some(packet_id))
    }

    /// Drop every queued packet at teardown. Returns how many were left.
    pub fn clear(&mut self) -> usize {
        self.contention_start = None;
        self.queues.iter_mut().map(AcQueue::clear).sum()
    }

    pub(crate) fn bounds_hold(&self) -> bool {
        self.queues.iter().all(AcQueue::bounds_hold)
    }
}

/// Time the channel needs to stay idle before `category` may transmit with
/// its current backoff.
pub fn contention_wait(queue: &AcQueue) -> Duration {
    queue.aifs() + SLOT * queue.state().current_backoff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::timing::aifs;
    use crate::mac::types::Destination;
    use rand::SeedableRng;

    fn engine(seed: u64) -> EdcaEngine {
        let params = [
            AccessCategory::Background.default_parameters(),
            AccessCategory::BestEffort.default_parameters(),
            AccessCategory::Video.default_parameters(),
            AccessCategory::Voice.default_parameters(),
        ];
        EdcaEngine::new(1, ChannelKind::Control, params, 0, StdRng::seed_from_u64(seed))
    }

    fn packet(id: PacketId, priority: u8) -> Packet {
        Packet {
            id,
            source: 1,
            destination: Destination::Broadcast,
            priority,
            payload_bytes: 50,
            datarate: None,
            tx_power_mw: None,
        }
    }

    fn us(micros: u64) -> Instant {
        Instant::from_micros(micros)
    }

    #[test]
    fn lone_voice_packet_fires_after_aifs() {
        let mut edca = engine(1);
        edca.enqueue(AccessCategory::Voice, packet(1, 6)).unwrap();
        let next = edca.schedule_next_contention(us(1_000), us(1_000), false);
        assert_eq!(next, Some(us(1_000) + aifs(2)));
    }

    #[test]
    fn submission_exactly_at_aifs_fires_immediately() {
        let mut edca = engine(1);
        edca.enqueue(AccessCategory::Voice, packet(1, 6)).unwrap();
        let idle_since = us(1_000);
        let now = idle_since + aifs(2);
        assert_eq!(edca.schedule_next_contention(now, idle_since, false), Some(now));
    }

    #[test]
    fn long_idle_rounds_up_to_next_slot_boundary() {
        let mut edca = engine(1);
        edca.enqueue(AccessCategory::Voice, packet(1, 6)).unwrap();
        // Idle since 0, AIFS(VO) = 58 us; at 100 us we are 42 us = 3 slots + 3 us past it.
        let next = edca.schedule_next_contention(us(100), us(0), false).unwrap();
        assert_eq!(next, us(58 + 4 * 13));
        assert_eq!((next - us(58)).as_ticks() % SLOT.as_ticks(), 0);
    }

    #[test]
    fn empty_engine_has_nothing_to_schedule() {
        let mut edca = engine(1);
        assert_eq!(edca.schedule_next_contention(us(0), us(0), false), None);
    }

    #[test]
    fn guard_redraws_a_zero_backoff() {
        // With cw 3 some seed draws a non-zero backoff; find the first that
        // does and check the scheduled time moved accordingly.
        for seed in 0..64 {
            let mut edca = engine(seed);
            edca.enqueue(AccessCategory::Voice, packet(1, 6)).unwrap();
            let next = edca.schedule_next_contention(us(0), us(0), true).unwrap();
            let backoffs = edca.stats().backoffs;
            assert_eq!(backoffs, 1);
            let backoff = edca.queue(AccessCategory::Voice).state().current_backoff;
            assert_eq!(next, us(0) + aifs(2) + SLOT * backoff);
            if backoff > 0 {
                return;
            }
        }
        panic!("no seed produced a non-zero backoff");
    }

    #[test]
    fn busy_before_aifs_does_not_decrement() {
        let mut edca = engine(3);
        edca.enqueue(AccessCategory::BestEffort, packet(1, 0)).unwrap();
        edca.queue_mut(AccessCategory::BestEffort).state_mut().current_backoff = 5;
        edca.schedule_next_contention(us(0), us(0), false);
        edca.stop_contention(us(50), true);
        assert_eq!(edca.queue(AccessCategory::BestEffort).state().current_backoff, 5);
        assert!(!edca.queue(AccessCategory::BestEffort).state().txop);
    }

    #[test]
    fn busy_after_aifs_charges_elapsed_slots() {
        let mut edca = engine(3);
        edca.enqueue(AccessCategory::BestEffort, packet(1, 0)).unwrap();
        edca.queue_mut(AccessCategory::BestEffort).state_mut().current_backoff = 5;
        edca.schedule_next_contention(us(0), us(0), false);
        // AIFS(BE) = 6 * 13 + 32 = 110 us; 2 more full slots and change.
        edca.stop_contention(us(110 + 2 * 13 + 5), true);
        assert_eq!(edca.queue(AccessCategory::BestEffort).state().current_backoff, 2);
        assert!(!edca.queue(AccessCategory::BestEffort).state().txop);
    }

    #[test]
    fn counting_down_to_zero_grants_txop_only_when_allowed() {
        let mut edca = engine(3);
        edca.enqueue(AccessCategory::Voice, packet(1, 6)).unwrap();
        edca.queue_mut(AccessCategory::Voice).state_mut().current_backoff = 1;
        edca.schedule_next_contention(us(0), us(0), false);
        edca.stop_contention(us(58 + 13), false);
        assert_eq!(edca.queue(AccessCategory::Voice).state().current_backoff, 0);
        assert!(!edca.queue(AccessCategory::Voice).state().txop);

        edca.queue_mut(AccessCategory::Voice).state_mut().current_backoff = 1;
        edca.schedule_next_contention(us(0), us(0), false);
        edca.stop_contention(us(58 + 13), true);
        assert_eq!(edca.queue(AccessCategory::Voice).state().current_backoff, 0);
        assert!(edca.queue(AccessCategory::Voice).state().txop);
    }

    #[test]
    fn stop_without_running_contention_is_a_no_op() {
        let mut edca = engine(3);
        edca.enqueue(AccessCategory::Voice, packet(1, 6)).unwrap();
        edca.queue_mut(AccessCategory::Voice).state_mut().current_backoff = 2;
        edca.stop_contention(us(10_000), true);
        assert_eq!(edca.queue(AccessCategory::Voice).state().current_backoff, 2);
    }

    #[test]
    fn empty_queue_post_backoff_never_gets_txop() {
        let mut edca = engine(3);
        edca.queue_mut(AccessCategory::Voice).state_mut().current_backoff = 3;
        edca.schedule_next_contention(us(0), us(0), false);
        edca.stop_contention(us(10_000), true);
        let state = edca.queue(AccessCategory::Voice).state();
        assert_eq!(state.current_backoff, 0);
        assert!(!state.txop);
    }

    #[test]
    fn internal_collision_favours_voice_over_video() {
        let mut edca = engine(11);
        edca.enqueue(AccessCategory::Voice, packet(1, 6)).unwrap();
        edca.enqueue(AccessCategory::Video, packet(2, 4)).unwrap();
        let start = us(0);
        // Both at backoff 0: VO ready at 58 us, VI at 71 us.
        edca.schedule_next_contention(start, start, false);
        edca.stop_contention(us(71), true);
        assert!(edca.queue(AccessCategory::Voice).state().txop);
        assert!(edca.queue(AccessCategory::Video).state().txop);

        let cw_before = edca.queue(AccessCategory::Video).state().cw_cur;
        let (winner, packet) = edca.initiate_transmit(us(71), start).unwrap();
        assert_eq!(winner, AccessCategory::Voice);
        assert_eq!(packet.id, 1);

        let video = edca.queue(AccessCategory::Video).state();
        assert!(video.cw_cur > cw_before);
        assert_eq!(video.cw_cur, 15);
        assert!(video.current_backoff <= video.cw_cur);
        assert!(!video.txop);
        assert_eq!(edca.stats().internal_collisions, 1);
        assert!(edca.bounds_hold());
    }

    #[test]
    fn initiate_transmit_without_txop_returns_none() {
        let mut edca = engine(1);
        edca.enqueue(AccessCategory::Voice, packet(1, 6)).unwrap();
        assert!(edca.initiate_transmit(us(1_000), us(0)).is_none());
    }

    #[test]
    fn post_transmit_pops_and_enters_backoff() {
        let mut edca = engine(5);
        edca.enqueue(AccessCategory::BestEffort, packet(1, 0)).unwrap();
        edca.enqueue(AccessCategory::BestEffort, packet(2, 0)).unwrap();
        edca.queue_mut(AccessCategory::BestEffort).grow_window();
        edca.post_transmit(AccessCategory::BestEffort, false);
        let queue = edca.queue(AccessCategory::BestEffort);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().map(|p| p.id), Some(2));
        assert_eq!(queue.state().cw_cur, 15);
        assert_eq!(edca.stats().backoffs, 1);
        assert!(edca.bounds_hold());
    }

    #[test]
    fn post_transmit_with_ack_blocks_head_of_line() {
        let mut edca = engine(5);
        edca.enqueue(AccessCategory::Voice, packet(7, 6)).unwrap();
        edca.post_transmit(AccessCategory::Voice, true);
        assert_eq!(edca.queue(AccessCategory::Voice).len(), 1);
        assert_eq!(edca.blocked_on(7), Some(AccessCategory::Voice));
        // Blocked queues are skipped by contention.
        assert_eq!(edca.schedule_next_contention(us(0), us(0), false), None);

        assert!(!edca.acknowledge(AccessCategory::Voice, 8));
        assert!(edca.acknowledge(AccessCategory::Voice, 7));
        assert!(edca.queue(AccessCategory::Voice).is_empty());
        assert!(!edca.queue(AccessCategory::Voice).is_blocked());
    }

    #[test]
    fn revoke_clears_granted_opportunities() {
        let mut edca = engine(5);
        edca.enqueue(AccessCategory::Voice, packet(1, 6)).unwrap();
        edca.schedule_next_contention(us(0), us(0), false);
        edca.stop_contention(us(58), true);
        assert!(edca.queue(AccessCategory::Voice).state().txop);
        edca.revoke_txops();
        assert!(!edca.queue(AccessCategory::Voice).state().txop);
        assert_eq!(edca.queue(AccessCategory::Voice).state().current_backoff, 0);
        assert_eq!(edca.queue(AccessCategory::Voice).len(), 1);
    }

    #[test]
    fn backoff_draws_cover_the_window_uniformly() {
        let mut edca = engine(42);
        edca.enqueue(AccessCategory::Video, packet(1, 4)).unwrap();
        let mut seen = [0u32; 8];
        for _ in 0..4_000 {
            let backoff = edca.draw_backoff(AccessCategory::Video);
            assert!(backoff <= 7);
            seen[backoff as usize] += 1;
        }
        // Each of the 8 values expected ~500 times.
        for count in seen {
            assert!(count > 350 && count < 650, "skewed draw distribution: {:?}", seen);
        }
    }

    #[test]
    fn contention_wait_adds_backoff_slots() {
        let mut edca = engine(1);
        edca.queue_mut(AccessCategory::Voice).state_mut().current_backoff = 3;
        assert_eq!(contention_wait(edca.queue(AccessCategory::Voice)), aifs(2) + SLOT * 3);
    }
}
