//! Unicast acknowledgment and retry bookkeeping.
//!
//! The controller remembers which (channel, category) pair is waiting for an
//! ACK and the timer guarding it, decides retry versus drop when the wait
//! fails, and filters duplicate deliveries caused by lost ACKs. The
//! scheduler owns the event flow; this type owns only the state.

use embassy_time::Instant;
use log::{debug, error, info};
use std::collections::{HashMap, HashSet, VecDeque};

use super::context::{MacContext, TimerHandle};
use super::edca::EdcaEngine;
use super::types::{AccessCategory, ChannelKind, MacAddress, MacEvent, Packet, PacketId};

/// What the retry policy did with the head-of-line packet.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// The packet stays queued for another attempt.
    Retry { attempt: u32 },
    /// The retry limit was exceeded and the packet was removed.
    Dropped(Packet),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
    pub short: u32,
    pub long: u32,
    /// Frames of at most this many bits count against the short limit.
    pub rts_threshold_bits: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingAck {
    packet_id: PacketId,
    /// `None` once the timeout fired but the decision was deferred.
    timer: Option<TimerHandle>,
}

/// Bounded FIFO memory of delivered `(source, packet id)` pairs.
#[derive(Debug, Default)]
struct DuplicateCache {
    capacity: usize,
    order: VecDeque<(MacAddress, PacketId)>,
    seen: HashSet<(MacAddress, PacketId)>,
}

impl DuplicateCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Record `key`. Returns `false` if it was already known.
    fn insert(&mut self, key: (MacAddress, PacketId)) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

pub struct AckController {
    node_id: u32,
    limits: RetryLimits,
    pending: HashMap<(ChannelKind, AccessCategory), PendingAck>,
    /// Entry armed last; the PHY reports receptions only for this one.
    expecting: Option<(ChannelKind, AccessCategory)>,
    /// A frame started arriving while an ACK was expected.
    rx_in_progress: bool,
    duplicates: DuplicateCache,
}

impl AckController {
    pub fn new(node_id: u32, limits: RetryLimits, duplicate_cache_capacity: usize) -> Self {
        Self {
            node_id,
            limits,
            pending: HashMap::new(),
            expecting: None,
            rx_in_progress: false,
            duplicates: DuplicateCache::new(duplicate_cache_capacity),
        }
    }

    /// Start waiting for the ACK of `packet_id`, timing out at `deadline`.
    pub fn arm(&mut self, ctx: &mut impl MacContext, channel: ChannelKind, category: AccessCategory, packet_id: PacketId, deadline: Instant) {
        let handle = ctx.schedule(deadline, MacEvent::AckTimeout { channel, category });
        if let Some(previous) = self.pending.insert((channel, category), PendingAck { packet_id, timer: Some(handle) }) {
            error!("[{}] {} {:?}: ACK timer armed twice (packet {})", self.node_id, channel.label(), category, previous.packet_id);
            if let Some(timer) = previous.timer {
                ctx.cancel(timer);
            }
        }
        self.expecting = Some((channel, category));
        self.rx_in_progress = false;
        debug!(
            "[{}] {} {:?}: waiting for ACK of packet {} until {} us",
            self.node_id,
            channel.label(),
            category,
            packet_id,
            deadline.as_micros()
        );
    }

    /// The PHY started receiving a frame.
    pub fn on_rx_start(&mut self) {
        if self.expecting.is_some() {
            self.rx_in_progress = true;
        }
    }

    /// The pending entry whose outcome hinges on the reception in progress.
    pub fn reception_pending(&self) -> Option<(ChannelKind, AccessCategory)> {
        if self.rx_in_progress { self.expecting } else { None }
    }

    /// The ACK timer of `(channel, category)` fired.
    ///
    /// Returns `true` when the retry policy should run now, `false` when the
    /// decision waits for the reception in progress to end (or the entry is
    /// unknown).
    pub fn timer_fired(&mut self, channel: ChannelKind, category: AccessCategory) -> bool {
        let Some(entry) = self.pending.get_mut(&(channel, category)) else {
            error!("[{}] {} {:?}: ACK timeout without pending ACK", self.node_id, channel.label(), category);
            return false;
        };
        entry.timer = None;
        if self.rx_in_progress && self.expecting == Some((channel, category)) {
            debug!(
                "[{}] {} {:?}: ACK timeout for packet {} during reception, deciding at reception end",
                self.node_id,
                channel.label(),
                category,
                entry.packet_id
            );
            return false;
        }
        true
    }

    /// Stop waiting on `(channel, category)`, cancelling its timer if it is
    /// still armed.
    pub fn release(&mut self, ctx: &mut impl MacContext, channel: ChannelKind, category: AccessCategory) {
        if let Some(entry) = self.pending.remove(&(channel, category)) {
            if let Some(timer) = entry.timer {
                ctx.cancel(timer);
            }
        }
        if self.expecting == Some((channel, category)) {
            self.expecting = None;
            self.rx_in_progress = false;
        }
    }

    /// The radio was retuned, so the reception in progress will never end.
    ///
    /// Returns the entry whose timeout already fired while waiting on that
    /// reception; its retry decision is due now. An entry whose timer is
    /// still armed is left to time out normally.
    pub fn reception_aborted(&mut self) -> Option<(ChannelKind, AccessCategory)> {
        if !std::mem::take(&mut self.rx_in_progress) {
            return None;
        }
        let key = self.expecting?;
        let entry = self.pending.get(&key)?;
        if entry.timer.is_some() {
            return None;
        }
        debug!(
            "[{}] {} {:?}: reception lost to a retune, deciding packet {} now",
            self.node_id,
            key.0.label(),
            key.1,
            entry.packet_id
        );
        Some(key)
    }

    /// Find the entry an incoming ACK for `packet_id` completes.
    pub fn match_ack(&self, packet_id: PacketId) -> Option<(ChannelKind, AccessCategory)> {
        self.pending.iter().find(|(_, entry)| entry.packet_id == packet_id).map(|(&key, _)| key)
    }

    /// Forget every pending ACK, cancelling timers that are still armed.
    pub fn clear(&mut self, ctx: &mut impl MacContext) {
        for (_, entry) in self.pending.drain() {
            if let Some(timer) = entry.timer {
                ctx.cancel(timer);
            }
        }
        self.expecting = None;
        self.rx_in_progress = false;
    }

    /// Returns `true` the first time `(source, packet_id)` is delivered.
    pub fn accept_delivery(&mut self, source: MacAddress, packet_id: PacketId) -> bool {
        self.duplicates.insert((source, packet_id))
    }

    /// Decide between another attempt and a drop for the head-of-line packet
    /// of `category`.
    ///
    /// Either way the queue is unblocked and a fresh backoff is drawn.
    /// Returns `None` if the queue is unexpectedly empty.
    pub fn apply_retry_policy(&self, engine: &mut EdcaEngine, category: AccessCategory, header_bits: u32) -> Option<RetryOutcome> {
        let frame_bits = engine.queue(category).front()?.frame_bits(header_bits);
        let short = frame_bits <= self.limits.rts_threshold_bits;

        let queue = engine.queue_mut(category);
        let state = queue.state_mut();
        let (count, limit) = if short {
            state.short_retry_count += 1;
            (state.short_retry_count, self.limits.short)
        } else {
            state.long_retry_count += 1;
            (state.long_retry_count, self.limits.long)
        };

        if count <= limit {
            queue.unblock();
            queue.grow_window();
            engine.draw_backoff(category);
            debug!(
                "[{}] {} {:?}: {} retry {} of {}, cw {}",
                self.node_id,
                engine.channel().label(),
                category,
                if short { "short" } else { "long" },
                count,
                limit,
                engine.queue(category).state().cw_cur
            );
            return Some(RetryOutcome::Retry { attempt: count });
        }

        let packet = engine.queue_mut(category).pop_front()?;
        engine.finish_head(category);
        info!(
            "[{}] {} {:?}: packet {} dropped after {} attempts",
            self.node_id,
            engine.channel().label(),
            category,
            packet.id,
            count
        );
        Some(RetryOutcome::Dropped(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::types::{Destination, RadioState, TransmitRequest};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[derive(Default)]
    struct TimerRecorder {
        next: u64,
        scheduled: Vec<(Instant, MacEvent)>,
        cancelled: Vec<TimerHandle>,
    }

    impl MacContext for TimerRecorder {
        fn now(&self) -> Instant {
            Instant::from_ticks(0)
        }
        fn schedule(&mut self, at: Instant, event: MacEvent) -> TimerHandle {
            self.next += 1;
            self.scheduled.push((at, event));
            TimerHandle(self.next)
        }
        fn cancel(&mut self, handle: TimerHandle) {
            self.cancelled.push(handle);
        }
        fn transmit(&mut self, _request: TransmitRequest) {}
        fn set_radio_state(&mut self, _state: RadioState) {}
        fn tune(&mut self, _frequency_hz: f64) {}
        fn deliver(&mut self, _packet: Packet) {}
    }

    fn controller(short: u32, long: u32) -> AckController {
        AckController::new(
            1,
            RetryLimits {
                short,
                long,
                rts_threshold_bits: 1_000,
            },
            4,
        )
    }

    fn engine_with(payload_bytes: u32) -> EdcaEngine {
        let params = [
            AccessCategory::Background.default_parameters(),
            AccessCategory::BestEffort.default_parameters(),
            AccessCategory::Video.default_parameters(),
            AccessCategory::Voice.default_parameters(),
        ];
        let mut engine = EdcaEngine::new(1, ChannelKind::Control, params, 0, StdRng::seed_from_u64(9));
        engine
            .enqueue(
                AccessCategory::BestEffort,
                Packet {
                    id: 77,
                    source: 1,
                    destination: Destination::Unicast(2),
                    priority: 0,
                    payload_bytes,
                    datarate: None,
                    tx_power_mw: None,
                },
            )
            .unwrap();
        engine.post_transmit(AccessCategory::BestEffort, true);
        engine
    }

    #[test]
    fn short_frames_retry_until_limit_then_drop() {
        let ack = controller(2, 1);
        let mut engine = engine_with(50);

        assert_eq!(ack.apply_retry_policy(&mut engine, AccessCategory::BestEffort, 88), Some(RetryOutcome::Retry { attempt: 1 }));
        assert_eq!(engine.queue(AccessCategory::BestEffort).state().cw_cur, 31);
        assert!(!engine.queue(AccessCategory::BestEffort).is_blocked());
        engine.post_transmit(AccessCategory::BestEffort, true);

        assert_eq!(ack.apply_retry_policy(&mut engine, AccessCategory::BestEffort, 88), Some(RetryOutcome::Retry { attempt: 2 }));
        assert_eq!(engine.queue(AccessCategory::BestEffort).state().cw_cur, 63);
        engine.post_transmit(AccessCategory::BestEffort, true);

        match ack.apply_retry_policy(&mut engine, AccessCategory::BestEffort, 88) {
            Some(RetryOutcome::Dropped(packet)) => assert_eq!(packet.id, 77),
            other => panic!("expected drop, got {:?}", other),
        }
        let queue = engine.queue(AccessCategory::BestEffort);
        assert!(queue.is_empty());
        assert!(!queue.is_blocked());
        assert_eq!(queue.state().short_retry_count, 0);
        assert_eq!(queue.state().cw_cur, 15);
        assert!(engine.bounds_hold());
    }

    #[test]
    fn long_frames_use_the_long_counter() {
        let ack = controller(7, 1);
        let mut engine = engine_with(500);
        assert_eq!(ack.apply_retry_policy(&mut engine, AccessCategory::BestEffort, 88), Some(RetryOutcome::Retry { attempt: 1 }));
        assert_eq!(engine.queue(AccessCategory::BestEffort).state().long_retry_count, 1);
        assert_eq!(engine.queue(AccessCategory::BestEffort).state().short_retry_count, 0);
        engine.post_transmit(AccessCategory::BestEffort, true);
        assert!(matches!(
            ack.apply_retry_policy(&mut engine, AccessCategory::BestEffort, 88),
            Some(RetryOutcome::Dropped(_))
        ));
    }

    #[test]
    fn release_cancels_an_unfired_timer() {
        let mut ack = controller(7, 4);
        let mut ctx = TimerRecorder::default();
        ack.arm(&mut ctx, ChannelKind::Control, AccessCategory::Voice, 5, Instant::from_micros(300));
        assert_eq!(ack.match_ack(5), Some((ChannelKind::Control, AccessCategory::Voice)));
        assert_eq!(ack.match_ack(6), None);
        assert_eq!(ctx.scheduled[0].0, Instant::from_micros(300));

        ack.release(&mut ctx, ChannelKind::Control, AccessCategory::Voice);
        assert_eq!(ctx.cancelled, vec![TimerHandle(1)]);
        assert_eq!(ack.match_ack(5), None);
    }

    #[test]
    fn fired_timer_is_not_cancelled_again() {
        let mut ack = controller(7, 4);
        let mut ctx = TimerRecorder::default();
        ack.arm(&mut ctx, ChannelKind::Service, AccessCategory::Video, 5, Instant::from_micros(300));
        assert!(ack.timer_fired(ChannelKind::Service, AccessCategory::Video));
        ack.release(&mut ctx, ChannelKind::Service, AccessCategory::Video);
        assert!(ctx.cancelled.is_empty());
    }

    #[test]
    fn timeout_during_reception_is_deferred() {
        let mut ack = controller(7, 4);
        let mut ctx = TimerRecorder::default();
        ack.on_rx_start();
        assert_eq!(ack.reception_pending(), None);

        ack.arm(&mut ctx, ChannelKind::Control, AccessCategory::Voice, 5, Instant::from_micros(300));
        ack.on_rx_start();
        assert_eq!(ack.reception_pending(), Some((ChannelKind::Control, AccessCategory::Voice)));
        assert!(!ack.timer_fired(ChannelKind::Control, AccessCategory::Voice));
        // Entry survives until the reception settles it.
        assert!(ack.match_ack(5).is_some());
    }

    #[test]
    fn retune_settles_a_deferred_timeout() {
        let mut ack = controller(7, 4);
        let mut ctx = TimerRecorder::default();
        ack.arm(&mut ctx, ChannelKind::Control, AccessCategory::Voice, 5, Instant::from_micros(300));
        ack.on_rx_start();
        assert!(!ack.timer_fired(ChannelKind::Control, AccessCategory::Voice));

        assert_eq!(ack.reception_aborted(), Some((ChannelKind::Control, AccessCategory::Voice)));
        assert_eq!(ack.reception_pending(), None);
        // Only once.
        assert_eq!(ack.reception_aborted(), None);
    }

    #[test]
    fn retune_before_timeout_leaves_the_timer_armed() {
        let mut ack = controller(7, 4);
        let mut ctx = TimerRecorder::default();
        ack.arm(&mut ctx, ChannelKind::Control, AccessCategory::Voice, 5, Instant::from_micros(300));
        ack.on_rx_start();

        assert_eq!(ack.reception_aborted(), None);
        assert_eq!(ack.reception_pending(), None);
        // With no reception left to wait for, the timeout decides right away.
        assert!(ack.timer_fired(ChannelKind::Control, AccessCategory::Voice));
    }

    #[test]
    fn duplicate_cache_is_bounded_fifo() {
        let mut ack = controller(7, 4);
        assert!(ack.accept_delivery(3, 1));
        assert!(!ack.accept_delivery(3, 1));
        assert!(ack.accept_delivery(4, 1));
        for id in 2..=4 {
            assert!(ack.accept_delivery(3, id));
        }
        // (3, 1) was evicted by the fifth insertion.
        assert!(ack.accept_delivery(3, 1));
        assert!(!ack.accept_delivery(3, 4));
    }
}
