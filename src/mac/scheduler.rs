//! Channel-access scheduler.
//!
//! [`Mac`] is the per-node top of the MAC. It owns one contention engine per
//! logical channel, alternates the radio between the control channel (CCH)
//! and the service channel (SCH) every switching interval, checks that a
//! frame fits before the next forced switch and relays radio notifications to
//! the engines and the ACK controller.
//!
//! All inputs arrive through [`Mac::handle_event`]; every reaction runs to
//! completion before the next event is dispatched.

use embassy_time::{Duration, Instant};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};

use super::ack::{AckController, RetryLimits, RetryOutcome};
use super::config::MacConfig;
use super::context::{MacContext, TimerHandle};
use super::edca::EdcaEngine;
use super::error::{MacError, SubmitError};
use super::timing::{CCH_FREQUENCY_HZ, RADIO_DELAY, SIFS, ack_wait, data_bits_per_symbol, frame_duration, service_channel_frequency};
use super::types::{
    AccessCategory, ChannelKind, Destination, Frame, FrameKind, MacAddress, MacCounters, MacEvent, Packet, PacketId, RadioState, RxFailure, TransmitRequest,
};

/// 1609.4 channel interval bookkeeping. Present only when switching is on.
#[derive(Debug, Clone, Copy)]
struct ChannelWindow {
    timer: Option<TimerHandle>,
    /// When the current interval started (or the MAC, before the first switch).
    last_switch: Instant,
    next_switch: Instant,
}

/// The transmission the radio is busy with.
#[derive(Debug, Clone, Copy)]
enum InFlight {
    Data {
        channel: ChannelKind,
        category: AccessCategory,
        packet_id: PacketId,
        uses_ack: bool,
        started: Instant,
        sending_duration: Duration,
    },
    Ack,
}

pub struct Mac {
    node_id: u32,
    address: MacAddress,
    config: MacConfig,
    bitrate: u64,
    n_dbps: u32,
    tx_power_mw: f64,
    service_frequency_hz: f64,

    control: EdcaEngine,
    service: Option<EdcaEngine>,
    active: ChannelKind,

    idle: bool,
    last_idle: Instant,
    last_busy: Instant,
    contention_timer: Option<TimerHandle>,
    window: Option<ChannelWindow>,
    in_flight: Option<InFlight>,
    /// Set while our own ACK is on its way out.
    ignore_channel_state: bool,

    ack: AckController,
    counters: MacCounters,
    rng: StdRng,
}

/// Engine of `channel`, borrowed field-wise so other fields stay usable.
fn engine_for<'a>(control: &'a mut EdcaEngine, service: &'a mut Option<EdcaEngine>, channel: ChannelKind) -> Option<&'a mut EdcaEngine> {
    match channel {
        ChannelKind::Control => Some(control),
        ChannelKind::Service => service.as_mut(),
    }
}

impl Mac {
    /// Build a MAC from a validated configuration.
    ///
    /// `seed` derives every random stream of this node: one per contention
    /// engine and one for the synchronisation offset.
    pub fn new(node_id: u32, address: MacAddress, config: MacConfig, seed: u64) -> Result<Self, MacError> {
        config.validate()?;
        let n_dbps = data_bits_per_symbol(config.bitrate).ok_or(MacError::InvalidBitrate(config.bitrate))?;
        let service_frequency_hz = service_channel_frequency(config.service_channel).ok_or(MacError::InvalidServiceChannel(config.service_channel))?;

        let mut master = StdRng::seed_from_u64(seed);
        let params = config.access_categories.as_array();
        let control = EdcaEngine::new(node_id, ChannelKind::Control, params, config.queue_size, StdRng::seed_from_u64(master.r#gen()));
        let service = config
            .use_service_channel
            .then(|| EdcaEngine::new(node_id, ChannelKind::Service, params, config.queue_size, StdRng::seed_from_u64(master.r#gen())));
        let rng = StdRng::seed_from_u64(master.r#gen());

        let ack = AckController::new(
            node_id,
            RetryLimits {
                short: config.short_retry_limit,
                long: config.long_retry_limit,
                rts_threshold_bits: config.rts_threshold_bits,
            },
            config.duplicate_cache_capacity,
        );

        Ok(Self {
            node_id,
            address,
            bitrate: config.bitrate,
            n_dbps,
            tx_power_mw: config.tx_power_mw,
            service_frequency_hz,
            config,
            control,
            service,
            active: ChannelKind::Control,
            idle: true,
            last_idle: Instant::from_ticks(0),
            last_busy: Instant::from_ticks(0),
            contention_timer: None,
            window: None,
            in_flight: None,
            ignore_channel_state: false,
            ack,
            counters: MacCounters::default(),
            rng,
        })
    }

    /// Bring the MAC up at `ctx.now()`.
    ///
    /// With switching enabled the first boundary is aligned to the global
    /// switching grid plus a random offset of at most `sync_offset_us`, and
    /// the starting channel follows the parity of the current interval.
    pub fn start(&mut self, ctx: &mut impl MacContext) {
        let now = ctx.now();
        if self.config.use_service_channel {
            let period = self.config.switching_interval().as_ticks();
            let interval_index = now.as_ticks() / period;
            let to_next = period - now.as_ticks() % period;
            self.active = if interval_index % 2 == 0 { ChannelKind::Control } else { ChannelKind::Service };

            let offset = if self.config.sync_offset_us == 0 {
                Duration::from_ticks(0)
            } else {
                let max = self.config.sync_offset_us as f64;
                let drawn: f64 = Uniform::new_inclusive(0.0, max).sample(&mut self.rng);
                Duration::from_micros(drawn as u64)
            };
            let next_switch = now + Duration::from_ticks(to_next) + offset;
            let timer = ctx.schedule(next_switch, MacEvent::ChannelSwitch);
            self.window = Some(ChannelWindow {
                timer: Some(timer),
                last_switch: now,
                next_switch,
            });
            debug!(
                "[{}] starting on {}, first switch at {} us (offset {} us)",
                self.node_id,
                self.active.label(),
                next_switch.as_micros(),
                offset.as_micros()
            );
        } else {
            self.active = ChannelKind::Control;
        }

        ctx.set_radio_state(RadioState::Rx);
        ctx.tune(self.frequency(self.active));
        self.idle = true;
        self.last_busy = now;
        self.channel_idle(ctx);
    }

    /// Dispatch one event.
    pub fn handle_event(&mut self, ctx: &mut impl MacContext, event: MacEvent) {
        match event {
            MacEvent::PacketSubmit { packet, channel } => {
                let packet_id = packet.id;
                if let Err(err) = self.submit(ctx, packet, channel) {
                    debug!("[{}] packet {} rejected: {}", self.node_id, packet_id, err);
                }
            }
            MacEvent::ChannelBusy => {
                if !self.ignore_channel_state {
                    self.channel_busy(ctx, false);
                }
            }
            MacEvent::ChannelIdle => {
                if !self.ignore_channel_state {
                    self.channel_idle(ctx);
                }
            }
            MacEvent::TxOver => self.tx_over(ctx),
            MacEvent::RxStart => self.ack.on_rx_start(),
            MacEvent::RxEndOk(frame) => self.receive(ctx, frame),
            MacEvent::RxEndFail(reason) => self.receive_failed(ctx, reason),
            MacEvent::ChannelSwitch => self.switch_channel(ctx),
            MacEvent::AckTimeout { channel, category } => {
                if self.ack.timer_fired(channel, category) {
                    self.retransmit(ctx, channel, category);
                }
            }
            MacEvent::ContentionFire => self.contention_fire(ctx),
        }

        if !self.bounds_hold() {
            error!("[{}] contention state out of bounds", self.node_id);
        }
    }

    /// Queue a packet from the upper layer for `channel`.
    ///
    /// Returns the packet's 1-based position in its access-category queue.
    pub fn submit(&mut self, ctx: &mut impl MacContext, packet: Packet, channel: ChannelKind) -> Result<usize, SubmitError> {
        let category = AccessCategory::from_priority(packet.priority).ok_or(SubmitError::InvalidPriority(packet.priority))?;
        if let Some(datarate) = packet.datarate {
            data_bits_per_symbol(datarate).ok_or(SubmitError::InvalidDatarate(datarate))?;
        }
        let engine = engine_for(&mut self.control, &mut self.service, channel).ok_or(SubmitError::ServiceChannelDisabled)?;

        let packet_id = packet.id;
        let position = match engine.enqueue(category, packet) {
            Ok(position) => position,
            Err(err) => {
                self.counters.dropped_queue_full += 1;
                info!("[{}] {} {:?}: packet {} dropped, queue full", self.node_id, channel.label(), category, packet_id);
                return Err(err);
            }
        };
        debug!(
            "[{}] {} {:?}: packet {} queued at position {}",
            self.node_id,
            channel.label(),
            category,
            packet_id,
            position
        );

        if position == 1 && channel == self.active {
            if self.idle {
                self.reschedule_contention(ctx);
            } else if engine.queue(category).state().current_backoff == 0 {
                // A packet arriving on a busy channel must not grab the medium
                // the instant it frees up.
                engine.draw_backoff(category);
            }
        }
        Ok(position)
    }

    fn contention_fire(&mut self, ctx: &mut impl MacContext) {
        self.contention_timer = None;
        let now = ctx.now();
        self.channel_busy(ctx, true);

        let channel = self.active;
        let last_idle = self.last_idle;
        let Some(engine) = engine_for(&mut self.control, &mut self.service, channel) else {
            error!("[{}] no contention engine for {}", self.node_id, channel.label());
            return;
        };
        let Some((category, packet)) = engine.initiate_transmit(now, last_idle) else {
            warn!("[{}] {}: contention fired with no queue ready", self.node_id, channel.label());
            self.counters.protocol_violations += 1;
            self.channel_idle(ctx);
            return;
        };

        let datarate = packet.datarate.unwrap_or(self.bitrate);
        let n_dbps = data_bits_per_symbol(datarate).unwrap_or(self.n_dbps);
        let tx_power_mw = packet.tx_power_mw.unwrap_or(self.tx_power_mw);
        let uses_ack = !packet.is_broadcast() && self.config.use_acks;
        let packet_id = packet.id;
        let frame = Frame::data(packet, self.config.header_length_bits);
        let duration = frame_duration(frame.bits, n_dbps);
        let sending_duration = RADIO_DELAY + duration;

        if let Some(left) = self.time_left_in_interval(now) {
            if left <= sending_duration {
                debug!(
                    "[{}] {} {:?}: packet {} needs {} us, only {} us left in interval",
                    self.node_id,
                    channel.label(),
                    category,
                    packet_id,
                    sending_duration.as_micros(),
                    left.as_micros()
                );
                self.counters.too_little_time += 1;
                if let Some(engine) = engine_for(&mut self.control, &mut self.service, channel) {
                    engine.revoke_txops();
                }
                self.channel_idle(ctx);
                return;
            }
        }

        debug!(
            "[{}] {} {:?}: sending packet {} ({} bits, {} us)",
            self.node_id,
            channel.label(),
            category,
            packet_id,
            frame.bits,
            duration.as_micros()
        );
        ctx.set_radio_state(RadioState::Tx);
        ctx.transmit(TransmitRequest {
            frame,
            start_delay: RADIO_DELAY,
            duration,
            frequency_hz: self.frequency(channel),
            datarate,
            tx_power_mw,
        });
        self.in_flight = Some(InFlight::Data {
            channel,
            category,
            packet_id,
            uses_ack,
            started: now,
            sending_duration,
        });
        self.counters.sent_packets += 1;
    }

    fn tx_over(&mut self, ctx: &mut impl MacContext) {
        ctx.set_radio_state(RadioState::Rx);
        match self.in_flight.take() {
            Some(InFlight::Data {
                channel,
                category,
                packet_id,
                uses_ack,
                started,
                sending_duration,
            }) => {
                if let Some(engine) = engine_for(&mut self.control, &mut self.service, channel) {
                    engine.post_transmit(category, uses_ack);
                }
                if uses_ack {
                    let deadline = started + sending_duration + ack_wait();
                    self.ack.arm(ctx, channel, category, packet_id, deadline);
                }
                if self.guard_active(ctx.now()) {
                    error!("[{}] packet {} was on the air during a guard interval", self.node_id, packet_id);
                }
            }
            Some(InFlight::Ack) => {
                self.ignore_channel_state = false;
            }
            None => {
                warn!("[{}] transmission finished with nothing in flight", self.node_id);
                self.counters.protocol_violations += 1;
            }
        }
    }

    fn switch_channel(&mut self, ctx: &mut impl MacContext) {
        let now = ctx.now();
        let interval = self.config.switching_interval();
        let Some(window) = self.window.as_mut() else {
            error!("[{}] channel switch with switching disabled", self.node_id);
            return;
        };
        window.last_switch = now;
        window.next_switch = now + interval;
        window.timer = Some(ctx.schedule(window.next_switch, MacEvent::ChannelSwitch));

        self.channel_busy(ctx, false);
        if let Some(engine) = engine_for(&mut self.control, &mut self.service, self.active) {
            engine.revoke_txops();
        }
        let from = self.active;
        self.active = from.other();
        debug!("[{}] {} --> {}", self.node_id, from.label(), self.active.label());
        ctx.tune(self.frequency(self.active));
        self.abort_reception(ctx);
        self.channel_idle(ctx);
    }

    /// The channel turned busy. `generate_txop` is set only when the busy
    /// period is our own contention win.
    fn channel_busy(&mut self, ctx: &mut impl MacContext, generate_txop: bool) {
        if !self.idle {
            return;
        }
        let now = ctx.now();
        self.idle = false;
        self.last_busy = now;
        if let Some(timer) = self.contention_timer.take() {
            ctx.cancel(timer);
        }
        if let Some(engine) = engine_for(&mut self.control, &mut self.service, self.active) {
            engine.stop_contention(now, generate_txop);
        }
    }

    fn channel_idle(&mut self, ctx: &mut impl MacContext) {
        if self.contention_timer.is_some() || self.in_flight.is_some() {
            return;
        }
        let now = ctx.now();
        self.idle = true;
        self.last_idle = now + self.guard_remaining(now);
        self.counters.total_busy_time_us += now.saturating_duration_since(self.last_busy).as_micros();

        let guard = self.guard_active(now);
        let last_idle = self.last_idle;
        let next_switch = self.window.map(|window| window.next_switch);
        let Some(engine) = engine_for(&mut self.control, &mut self.service, self.active) else {
            return;
        };
        let Some(next_event) = engine.schedule_next_contention(now, last_idle, guard) else {
            return;
        };
        match next_switch {
            Some(switch_at) if next_event >= switch_at => {
                debug!("[{}] {}: too little time left in this interval", self.node_id, self.active.label());
                self.counters.too_little_time += 1;
                engine.revoke_txops();
            }
            _ => {
                self.contention_timer = Some(ctx.schedule(next_event, MacEvent::ContentionFire));
            }
        }
    }

    /// Recompute the contention deadline while the channel stays idle, after
    /// a queue became eligible.
    fn reschedule_contention(&mut self, ctx: &mut impl MacContext) {
        let now = ctx.now();
        let guard = self.guard_active(now);
        let last_idle = self.last_idle;
        let next_switch = self.window.map(|window| window.next_switch);
        let Some(engine) = engine_for(&mut self.control, &mut self.service, self.active) else {
            return;
        };
        let next_event = engine.schedule_next_contention(now, last_idle, guard);

        match (next_event, next_switch) {
            (Some(at), Some(switch_at)) if at > switch_at => {
                debug!("[{}] {}: too little time left in this interval", self.node_id, self.active.label());
                engine.revoke_txops();
                self.counters.too_little_time += 1;
            }
            (Some(at), _) => {
                if let Some(timer) = self.contention_timer.take() {
                    ctx.cancel(timer);
                }
                self.contention_timer = Some(ctx.schedule(at, MacEvent::ContentionFire));
            }
            (None, _) => {
                if let Some(timer) = self.contention_timer.take() {
                    ctx.cancel(timer);
                }
            }
        }
    }

    /// Retuning drops whatever the radio was receiving. An ACK timeout that
    /// was waiting on that reception is decided now.
    fn abort_reception(&mut self, ctx: &mut impl MacContext) {
        if let Some((channel, category)) = self.ack.reception_aborted() {
            self.retransmit(ctx, channel, category);
        }
    }

    /// Run the retry policy for the packet awaiting an ACK on
    /// `(channel, category)`.
    fn retransmit(&mut self, ctx: &mut impl MacContext, channel: ChannelKind, category: AccessCategory) {
        self.ack.release(ctx, channel, category);
        let Some(engine) = engine_for(&mut self.control, &mut self.service, channel) else {
            error!("[{}] no contention engine for {}", self.node_id, channel.label());
            return;
        };
        match self.ack.apply_retry_policy(engine, category, self.config.header_length_bits) {
            Some(RetryOutcome::Retry { .. }) => self.counters.retransmissions += 1,
            Some(RetryOutcome::Dropped(_)) => self.counters.dropped_retry_limit += 1,
            None => {
                error!("[{}] {} {:?}: retry with an empty queue", self.node_id, channel.label(), category);
                return;
            }
        }
        if self.idle && channel == self.active {
            self.reschedule_contention(ctx);
        }
    }

    fn receive(&mut self, ctx: &mut impl MacContext, frame: Frame) {
        let for_me = frame.destination == Destination::Unicast(self.address);
        match frame.kind {
            FrameKind::Ack { packet_id } => {
                let matched = if for_me { self.ack.match_ack(packet_id) } else { None };
                match matched {
                    Some((channel, category)) => {
                        self.ack.release(ctx, channel, category);
                        if let Some(engine) = engine_for(&mut self.control, &mut self.service, channel) {
                            engine.acknowledge(category, packet_id);
                        }
                        self.counters.received_acks += 1;
                        debug!("[{}] {} {:?}: packet {} acknowledged", self.node_id, channel.label(), category, packet_id);
                        if self.idle && channel == self.active {
                            self.reschedule_contention(ctx);
                        }
                    }
                    None => {
                        if for_me {
                            warn!("[{}] unexpected ACK for packet {} from {}", self.node_id, packet_id, frame.source);
                            self.counters.protocol_violations += 1;
                        }
                        if let Some((channel, category)) = self.ack.reception_pending() {
                            self.retransmit(ctx, channel, category);
                        }
                    }
                }
            }
            FrameKind::Data(packet) => {
                if let Some((channel, category)) = self.ack.reception_pending() {
                    self.retransmit(ctx, channel, category);
                }
                match frame.destination {
                    Destination::Unicast(_) if for_me => {
                        self.counters.received_unicast += 1;
                        if self.config.use_acks {
                            self.send_ack(ctx, frame.source, packet.id);
                        }
                        if self.ack.accept_delivery(frame.source, packet.id) {
                            ctx.deliver(packet);
                        } else {
                            self.counters.duplicates_suppressed += 1;
                            debug!("[{}] duplicate packet {} from {} suppressed", self.node_id, packet.id, frame.source);
                        }
                    }
                    Destination::Broadcast => {
                        self.counters.received_broadcasts += 1;
                        ctx.deliver(packet);
                    }
                    Destination::Unicast(_) => {}
                }
            }
        }
    }

    fn receive_failed(&mut self, ctx: &mut impl MacContext, reason: RxFailure) {
        match reason {
            RxFailure::BitError | RxFailure::Collision => self.counters.snir_lost += 1,
            RxFailure::ReceivedWhileSending => self.counters.txrx_lost += 1,
        }
        if let Some((channel, category)) = self.ack.reception_pending() {
            self.retransmit(ctx, channel, category);
        }
    }

    fn send_ack(&mut self, ctx: &mut impl MacContext, destination: MacAddress, packet_id: PacketId) {
        if self.in_flight.is_some() {
            error!("[{}] cannot acknowledge packet {}, radio busy", self.node_id, packet_id);
            return;
        }
        let now = ctx.now();
        let duration = frame_duration(self.config.ack_length_bits as u64, self.n_dbps);
        let start_delay = RADIO_DELAY + SIFS;
        if let Some(left) = self.time_left_in_interval(now) {
            if left <= start_delay + duration {
                debug!("[{}] no time left to acknowledge packet {}", self.node_id, packet_id);
                self.counters.too_little_time += 1;
                return;
            }
        }

        self.channel_busy(ctx, false);
        self.ignore_channel_state = true;
        ctx.set_radio_state(RadioState::Tx);
        ctx.transmit(TransmitRequest {
            frame: Frame::ack(self.address, destination, packet_id, self.config.ack_length_bits),
            start_delay,
            duration,
            frequency_hz: self.frequency(self.active),
            datarate: self.bitrate,
            tx_power_mw: self.tx_power_mw,
        });
        self.in_flight = Some(InFlight::Ack);
        self.counters.sent_acks += 1;
    }

    /// Move to another service channel. Takes effect immediately when the
    /// service channel is active, otherwise at the next switch.
    pub fn change_service_channel(&mut self, ctx: &mut impl MacContext, service_channel: u8) -> Result<(), MacError> {
        let frequency = service_channel_frequency(service_channel).ok_or(MacError::InvalidServiceChannel(service_channel))?;
        self.config.service_channel = service_channel;
        self.service_frequency_hz = frequency;
        if self.active == ChannelKind::Service {
            ctx.tune(frequency);
            self.abort_reception(ctx);
        }
        Ok(())
    }

    pub fn set_tx_power(&mut self, tx_power_mw: f64) -> Result<(), MacError> {
        if !(tx_power_mw.is_finite() && tx_power_mw > 0.0) {
            return Err(MacError::InvalidTxPower(tx_power_mw));
        }
        self.tx_power_mw = tx_power_mw;
        Ok(())
    }

    pub fn set_bitrate(&mut self, bitrate: u64) -> Result<(), MacError> {
        self.n_dbps = data_bits_per_symbol(bitrate).ok_or(MacError::InvalidBitrate(bitrate))?;
        self.bitrate = bitrate;
        Ok(())
    }

    pub fn is_channel_switching_active(&self) -> bool {
        self.window.is_some()
    }

    pub fn switching_interval(&self) -> Duration {
        self.config.switching_interval()
    }

    pub fn is_current_channel_control(&self) -> bool {
        self.active == ChannelKind::Control
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    pub fn engine(&self, channel: ChannelKind) -> Option<&EdcaEngine> {
        match channel {
            ChannelKind::Control => Some(&self.control),
            ChannelKind::Service => self.service.as_ref(),
        }
    }

    /// Counters so far, including the engines' backoff statistics.
    pub fn counters(&self) -> MacCounters {
        let mut counters = self.counters;
        for engine in std::iter::once(&self.control).chain(self.service.as_ref()) {
            let stats = engine.stats();
            counters.internal_collisions += stats.internal_collisions;
            counters.backoffs += stats.backoffs;
            counters.backoff_slots += stats.backoff_slots;
        }
        counters
    }

    /// Tear the MAC down: cancel every timer, drop queued packets and
    /// report the final counters.
    pub fn finish(&mut self, ctx: &mut impl MacContext) -> MacCounters {
        if let Some(timer) = self.contention_timer.take() {
            ctx.cancel(timer);
        }
        if let Some(timer) = self.window.as_mut().and_then(|window| window.timer.take()) {
            ctx.cancel(timer);
        }
        self.ack.clear(ctx);

        let queued = self.control.clear() + self.service.as_mut().map_or(0, EdcaEngine::clear);
        self.counters.queued_at_teardown = queued as u64;
        let counters = self.counters();
        info!(
            "[{}] finished: sent {} packets and {} ACKs, received {} unicast and {} broadcast, {} left queued",
            self.node_id, counters.sent_packets, counters.sent_acks, counters.received_unicast, counters.received_broadcasts, queued
        );
        counters
    }

    fn frequency(&self, channel: ChannelKind) -> f64 {
        match channel {
            ChannelKind::Control => CCH_FREQUENCY_HZ,
            ChannelKind::Service => self.service_frequency_hz,
        }
    }

    fn guard_active(&self, now: Instant) -> bool {
        self.window
            .is_some_and(|window| now.saturating_duration_since(window.last_switch) <= self.config.guard_interval())
    }

    fn guard_remaining(&self, now: Instant) -> Duration {
        match self.window {
            Some(window) if self.guard_active(now) => self.config.guard_interval() - now.saturating_duration_since(window.last_switch),
            _ => Duration::from_ticks(0),
        }
    }

    fn time_left_in_interval(&self, now: Instant) -> Option<Duration> {
        self.window.map(|window| window.next_switch.saturating_duration_since(now))
    }

    fn bounds_hold(&self) -> bool {
        self.control.bounds_hold() && self.service.as_ref().is_none_or(EdcaEngine::bounds_hold)
    }
}
