//! Ideal shared wireless medium.
//!
//! Every node hears every other node tuned to the same frequency; there is no
//! path loss and no bit error model. Two transmissions overlapping on one
//! frequency destroy each other at every receiver. The medium turns
//! transmissions into the notifications a PHY would raise:
//! - `ChannelBusy` / `ChannelIdle` when a frequency goes from quiet to
//!   occupied and back
//! - `RxStart` and `RxEndOk` / `RxEndFail` at receivers
//! - `TxOver` at the sender
//!
//! Notifications are returned to the caller in the order they must be
//! dispatched.

use embassy_time::Instant;
use log::debug;
use serde::Serialize;
use std::collections::HashMap;

use crate::mac::{Frame, MacEvent, RxFailure, TransmitRequest};

/// Notification for the node at the given index.
pub type Notification = (usize, MacEvent);

/// Aggregate medium statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediumStats {
    pub transmissions: u64,
    pub delivered_frames: u64,
    pub collided_frames: u64,
}

struct Transmission {
    sender: usize,
    frame: Frame,
    frequency_hz: f64,
}

#[derive(Debug, Clone, Copy)]
struct Reception {
    transmission: u64,
    failure: Option<RxFailure>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Listener {
    frequency_hz: f64,
    transmitting: Option<u64>,
    receiving: Option<Reception>,
}

#[derive(Default)]
pub struct Medium {
    listeners: Vec<Listener>,
    active: HashMap<u64, Transmission>,
    next_id: u64,
    stats: MediumStats,
}

impl Medium {
    pub fn new(node_count: usize) -> Self {
        Self {
            listeners: vec![Listener::default(); node_count],
            ..Default::default()
        }
    }

    pub fn stats(&self) -> MediumStats {
        self.stats
    }

    fn is_occupied(&self, frequency_hz: f64) -> bool {
        self.active.values().any(|tx| tx.frequency_hz == frequency_hz)
    }

    fn tuned_to(&self, frequency_hz: f64) -> impl Iterator<Item = usize> + '_ {
        self.listeners
            .iter()
            .enumerate()
            .filter(move |(_, listener)| listener.frequency_hz == frequency_hz)
            .map(|(index, _)| index)
    }

    /// Retune `node`. A reception in progress is lost; a busy frequency is
    /// reported right away.
    pub fn tune(&mut self, node: usize, frequency_hz: f64) -> Vec<Notification> {
        let Some(listener) = self.listeners.get_mut(node) else {
            return Vec::new();
        };
        if listener.frequency_hz == frequency_hz {
            return Vec::new();
        }
        listener.frequency_hz = frequency_hz;
        listener.receiving = None;
        if self.is_occupied(frequency_hz) {
            vec![(node, MacEvent::ChannelBusy)]
        } else {
            Vec::new()
        }
    }

    /// First bit of `request` leaves the antenna of `node`.
    ///
    /// Returns the transmission id to pass to [`Medium::end`] once the frame
    /// is over.
    pub fn begin(&mut self, node: usize, request: TransmitRequest) -> (u64, Vec<Notification>) {
        let id = self.next_id;
        self.next_id += 1;
        self.stats.transmissions += 1;

        let frequency_hz = request.frequency_hz;
        let mut notifications = Vec::new();
        if !self.is_occupied(frequency_hz) {
            notifications.extend(self.tuned_to(frequency_hz).map(|index| (index, MacEvent::ChannelBusy)));
        }

        if let Some(sender) = self.listeners.get_mut(node) {
            sender.transmitting = Some(id);
            if let Some(reception) = sender.receiving.as_mut() {
                reception.failure = Some(RxFailure::ReceivedWhileSending);
            }
        }

        for (index, listener) in self.listeners.iter_mut().enumerate() {
            if index == node || listener.frequency_hz != frequency_hz {
                continue;
            }
            match listener.receiving.as_mut() {
                Some(reception) => {
                    // Overlap: the frame being received is lost and the new
                    // one is never locked onto.
                    if reception.failure.is_none() {
                        reception.failure = Some(RxFailure::Collision);
                    }
                }
                None if listener.transmitting.is_some() => {
                    listener.receiving = Some(Reception {
                        transmission: id,
                        failure: Some(RxFailure::ReceivedWhileSending),
                    });
                }
                None => {
                    listener.receiving = Some(Reception { transmission: id, failure: None });
                    notifications.push((index, MacEvent::RxStart));
                }
            }
        }

        debug!(
            "Medium: node {} starts {} bit frame on {:.3} GHz",
            node,
            request.frame.bits,
            frequency_hz / 1e9
        );
        self.active.insert(
            id,
            Transmission {
                sender: node,
                frame: request.frame,
                frequency_hz,
            },
        );
        (id, notifications)
    }

    /// Last bit of transmission `id` is on the air.
    pub fn end(&mut self, id: u64) -> Vec<Notification> {
        let Some(transmission) = self.active.remove(&id) else {
            return Vec::new();
        };
        let mut notifications = Vec::new();

        if let Some(sender) = self.listeners.get_mut(transmission.sender) {
            if sender.transmitting == Some(id) {
                sender.transmitting = None;
            }
        }
        notifications.push((transmission.sender, MacEvent::TxOver));

        for (index, listener) in self.listeners.iter_mut().enumerate() {
            let Some(reception) = listener.receiving else {
                continue;
            };
            if reception.transmission != id {
                continue;
            }
            listener.receiving = None;
            match reception.failure {
                None => {
                    self.stats.delivered_frames += 1;
                    notifications.push((index, MacEvent::RxEndOk(transmission.frame.clone())));
                }
                Some(failure) => {
                    if failure == RxFailure::Collision {
                        self.stats.collided_frames += 1;
                    }
                    notifications.push((index, MacEvent::RxEndFail(failure)));
                }
            }
        }

        if !self.is_occupied(transmission.frequency_hz) {
            notifications.extend(self.tuned_to(transmission.frequency_hz).map(|index| (index, MacEvent::ChannelIdle)));
        }
        notifications
    }
}
