//! Type definitions shared by the MAC components.
//!
//! Contains:
//! - Access categories and their EDCA parameters
//! - Packets, frames and the transmit request handed to the radio
//! - The event enum every MAC reaction is dispatched from
//! - Teardown counters

use embassy_time::Duration;
use serde::{Deserialize, Serialize};

use super::timing::{CWMAX_11P, CWMIN_11P};

/// Link-layer address of a node.
pub type MacAddress = u32;

/// Network-wide unique identifier of an upper-layer packet.
pub type PacketId = u64;

/// EDCA traffic class. The discriminant doubles as the queue index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessCategory {
    Background = 0,
    BestEffort = 1,
    Video = 2,
    Voice = 3,
}

impl AccessCategory {
    /// Categories from highest to lowest priority. Every "who goes first"
    /// decision iterates in this order.
    pub const BY_PRIORITY: [AccessCategory; 4] = [AccessCategory::Voice, AccessCategory::Video, AccessCategory::BestEffort, AccessCategory::Background];

    /// Map an 802.1D user priority (0..=7) to its access category.
    pub fn from_priority(priority: u8) -> Option<Self> {
        match priority {
            1 | 2 => Some(AccessCategory::Background),
            0 | 3 => Some(AccessCategory::BestEffort),
            4 | 5 => Some(AccessCategory::Video),
            6 | 7 => Some(AccessCategory::Voice),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// 802.11p defaults for this category.
    pub fn default_parameters(self) -> AcParameters {
        match self {
            AccessCategory::Voice => AcParameters {
                aifsn: 2,
                cw_min: (CWMIN_11P + 1) / 4 - 1,
                cw_max: (CWMIN_11P + 1) / 2 - 1,
            },
            AccessCategory::Video => AcParameters {
                aifsn: 3,
                cw_min: (CWMIN_11P + 1) / 2 - 1,
                cw_max: CWMIN_11P,
            },
            AccessCategory::BestEffort => AcParameters {
                aifsn: 6,
                cw_min: CWMIN_11P,
                cw_max: CWMAX_11P,
            },
            AccessCategory::Background => AcParameters {
                aifsn: 9,
                cw_min: CWMIN_11P,
                cw_max: CWMAX_11P,
            },
        }
    }
}

/// Per-category EDCA parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AcParameters {
    /// Number of slots added to SIFS to form the AIFS.
    pub aifsn: u32,
    pub cw_min: u32,
    pub cw_max: u32,
}

/// The two 1609.4 channel roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Control,
    Service,
}

impl ChannelKind {
    pub fn other(self) -> Self {
        match self {
            ChannelKind::Control => ChannelKind::Service,
            ChannelKind::Service => ChannelKind::Control,
        }
    }

    /// Short label used in log lines.
    pub fn label(self) -> &'static str {
        match self {
            ChannelKind::Control => "CCH",
            ChannelKind::Service => "SCH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Unicast(MacAddress),
    Broadcast,
}

/// Upper-layer packet queued in the MAC.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: PacketId,
    pub source: MacAddress,
    pub destination: Destination,
    /// 802.1D user priority, 0..=7.
    pub priority: u8,
    pub payload_bytes: u32,
    /// Overrides the configured bit rate for this packet only.
    pub datarate: Option<u64>,
    /// Overrides the configured transmit power for this packet only.
    pub tx_power_mw: Option<f64>,
}

impl Packet {
    pub fn is_broadcast(&self) -> bool {
        self.destination == Destination::Broadcast
    }

    /// Length of the data frame carrying this packet.
    pub fn frame_bits(&self, header_bits: u32) -> u64 {
        header_bits as u64 + self.payload_bytes as u64 * 8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    Data(Packet),
    Ack { packet_id: PacketId },
}

/// A frame as it travels over the air.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub source: MacAddress,
    pub destination: Destination,
    pub bits: u64,
    pub kind: FrameKind,
}

impl Frame {
    pub fn data(packet: Packet, header_bits: u32) -> Self {
        Frame {
            source: packet.source,
            destination: packet.destination,
            bits: packet.frame_bits(header_bits),
            kind: FrameKind::Data(packet),
        }
    }

    pub fn ack(source: MacAddress, destination: MacAddress, packet_id: PacketId, bits: u32) -> Self {
        Frame {
            source,
            destination: Destination::Unicast(destination),
            bits: bits as u64,
            kind: FrameKind::Ack { packet_id },
        }
    }
}

/// Everything the radio needs to put one frame on the air.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmitRequest {
    pub frame: Frame,
    /// Delay before the first bit leaves the antenna. Always covers the
    /// Rx→Tx turnaround.
    pub start_delay: Duration,
    /// On-air duration of the frame.
    pub duration: Duration,
    pub frequency_hz: f64,
    pub datarate: u64,
    pub tx_power_mw: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Rx,
    Tx,
}

/// Why the PHY failed to decode a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxFailure {
    BitError,
    Collision,
    /// The frame arrived while this node was transmitting.
    ReceivedWhileSending,
}

/// Every input the MAC reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum MacEvent {
    /// Upper layer hands a packet to the MAC.
    PacketSubmit { packet: Packet, channel: ChannelKind },
    /// PHY sensed energy on the channel.
    ChannelBusy,
    /// PHY sensed the channel going quiet.
    ChannelIdle,
    /// The radio finished sending the in-flight frame.
    TxOver,
    /// The PHY locked onto an incoming frame.
    RxStart,
    RxEndOk(Frame),
    RxEndFail(RxFailure),
    /// 1609.4 channel interval boundary.
    ChannelSwitch,
    AckTimeout { channel: ChannelKind, category: AccessCategory },
    /// The earliest contention deadline was reached.
    ContentionFire,
}

impl MacEvent {
    /// Ordering class for events sharing a timestamp (lower runs first).
    ///
    /// Radio notifications settle the channel state before any timer looks at
    /// it, and contention is resolved before new packets are queued.
    pub fn dispatch_class(&self) -> u8 {
        match self {
            MacEvent::ChannelBusy | MacEvent::ChannelIdle | MacEvent::TxOver | MacEvent::RxStart | MacEvent::RxEndOk(_) | MacEvent::RxEndFail(_) => 0,
            MacEvent::AckTimeout { .. } => 1,
            MacEvent::ChannelSwitch => 2,
            MacEvent::ContentionFire => 3,
            MacEvent::PacketSubmit { .. } => 4,
        }
    }
}

/// Read-only counters collected over a node's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MacCounters {
    pub sent_packets: u64,
    pub sent_acks: u64,
    pub received_unicast: u64,
    pub received_broadcasts: u64,
    pub received_acks: u64,
    pub duplicates_suppressed: u64,
    pub dropped_queue_full: u64,
    pub dropped_retry_limit: u64,
    pub retransmissions: u64,
    pub too_little_time: u64,
    pub internal_collisions: u64,
    pub backoffs: u64,
    pub backoff_slots: u64,
    pub snir_lost: u64,
    pub txrx_lost: u64,
    pub protocol_violations: u64,
    pub total_busy_time_us: u64,
    /// Packets still queued when the MAC was torn down.
    pub queued_at_teardown: u64,
}
