//! Network simulation driver.
//!
//! Builds one [`Mac`] per scenario node, connects them through the ideal
//! [`Medium`] and runs the discrete-event loop until the scenario duration
//! elapses. Each step:
//! 1. Pops the next event and publishes its time to the virtual clock
//! 2. Dispatches it (MAC event, medium transition or traffic generation)
//! 3. Applies what the MAC asked for through its [`NodeContext`]:
//!    transmissions become medium events, retunes go to the medium and
//!    deliveries are counted

use embassy_time::{Duration, Instant};
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;

use super::event_queue::EventQueue;
use super::medium::{Medium, MediumStats, Notification};
use super::scenario::Scenario;
use crate::mac::{ChannelKind, Destination, Mac, MacConfig, MacContext, MacCounters, MacError, MacEvent, Packet, RadioState, TimerHandle, TransmitRequest};
use crate::time_driver;

/// Dispatch class of medium transitions, same as radio notifications.
const RADIO_CLASS: u8 = 0;
/// Dispatch class of traffic generation, same as packet submission.
const TRAFFIC_CLASS: u8 = 4;

#[derive(Debug)]
enum SimEvent {
    NodeStart { node: usize },
    Mac { node: usize, event: MacEvent },
    TxStart { node: usize, request: TransmitRequest },
    TxEnd { transmission: u64 },
    Traffic { flow: usize },
}

/// What a MAC asked for while handling one event.
#[derive(Debug)]
enum NodeAction {
    Transmit(TransmitRequest),
    Tune(f64),
    Deliver(Packet),
}

/// [`MacContext`] handed to one node's MAC for the duration of one event.
struct NodeContext<'a> {
    node: usize,
    events: &'a mut EventQueue<SimEvent>,
    actions: Vec<NodeAction>,
}

impl MacContext for NodeContext<'_> {
    fn now(&self) -> Instant {
        self.events.now()
    }

    fn schedule(&mut self, at: Instant, event: MacEvent) -> TimerHandle {
        let class = event.dispatch_class();
        self.events.schedule(at, class, SimEvent::Mac { node: self.node, event })
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.events.cancel(handle);
    }

    fn transmit(&mut self, request: TransmitRequest) {
        self.actions.push(NodeAction::Transmit(request));
    }

    fn set_radio_state(&mut self, _state: RadioState) {
        // The ideal medium tracks transmit state from the requests themselves.
    }

    fn tune(&mut self, frequency_hz: f64) {
        self.actions.push(NodeAction::Tune(frequency_hz));
    }

    fn deliver(&mut self, packet: Packet) {
        self.actions.push(NodeAction::Deliver(packet));
    }
}

struct SimNode {
    node_id: u32,
    mac: Mac,
    submitted: u64,
    delivered: u64,
}

struct Flow {
    source: usize,
    destination: Destination,
    priority: u8,
    payload_bytes: u32,
    interval: Duration,
    remaining: Option<u64>,
    channel: ChannelKind,
    datarate: Option<u64>,
}

/// Per-node outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node_id: u32,
    pub submitted: u64,
    pub delivered: u64,
    pub counters: MacCounters,
}

/// Outcome of a whole run, printed as JSON by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub duration_us: u64,
    pub events_processed: u64,
    pub submitted: u64,
    pub delivered: u64,
    pub medium: MediumStats,
    pub nodes: Vec<NodeReport>,
}

pub struct Network {
    nodes: Vec<SimNode>,
    medium: Medium,
    events: EventQueue<SimEvent>,
    flows: Vec<Flow>,
    end: Instant,
    next_packet_id: u64,
    events_processed: u64,
}

impl Network {
    /// Build the network described by `scenario`, every node sharing `config`.
    ///
    /// The scenario is expected to be validated already.
    pub fn new(scenario: &Scenario, config: &MacConfig) -> Result<Self, MacError> {
        time_driver::reset();

        let mut events = EventQueue::new();
        let mut nodes = Vec::with_capacity(scenario.nodes.len());
        let mut index_by_id = HashMap::new();
        for (index, node) in scenario.nodes.iter().enumerate() {
            // Distinct, reproducible stream per node.
            let seed = scenario.seed ^ (node.node_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            let mac = Mac::new(node.node_id, node.node_id, config.clone(), seed)?;
            nodes.push(SimNode {
                node_id: node.node_id,
                mac,
                submitted: 0,
                delivered: 0,
            });
            index_by_id.insert(node.node_id, index);
            events.schedule(Instant::from_micros(node.start_us), RADIO_CLASS, SimEvent::NodeStart { node: index });
        }

        let mut flows = Vec::with_capacity(scenario.flows.len());
        for flow_spec in &scenario.flows {
            let Some(&source) = index_by_id.get(&flow_spec.source) else {
                continue;
            };
            let flow = flows.len();
            flows.push(Flow {
                source,
                destination: flow_spec.destination.map_or(Destination::Broadcast, Destination::Unicast),
                priority: flow_spec.priority,
                payload_bytes: flow_spec.payload_bytes,
                interval: Duration::from_micros(flow_spec.interval_us),
                remaining: flow_spec.count,
                channel: flow_spec.channel,
                datarate: flow_spec.datarate,
            });
            events.schedule(Instant::from_micros(flow_spec.start_us), TRAFFIC_CLASS, SimEvent::Traffic { flow });
        }

        info!("Network built with {} nodes and {} flows", nodes.len(), flows.len());
        Ok(Self {
            medium: Medium::new(nodes.len()),
            nodes,
            events,
            flows,
            end: Instant::from_millis(scenario.duration_ms),
            next_packet_id: 1,
            events_processed: 0,
        })
    }

    /// Run until the scenario duration elapses, then tear every MAC down.
    pub fn run(&mut self) -> SimulationReport {
        while let Some(at) = self.events.peek_time() {
            if at > self.end {
                break;
            }
            let Some((_, at, event)) = self.events.pop() else {
                break;
            };
            time_driver::advance_to(at);
            self.events_processed += 1;
            self.process(event);
        }
        time_driver::advance_to(self.end);
        self.finish()
    }

    fn process(&mut self, event: SimEvent) {
        match event {
            SimEvent::NodeStart { node } => {
                let mut ctx = NodeContext {
                    node,
                    events: &mut self.events,
                    actions: Vec::new(),
                };
                self.nodes[node].mac.start(&mut ctx);
                let actions = ctx.actions;
                self.apply(node, actions);
            }
            SimEvent::Mac { node, event } => self.dispatch(node, event),
            SimEvent::TxStart { node, request } => {
                let duration = request.duration;
                let (transmission, notifications) = self.medium.begin(node, request);
                self.events.schedule(self.events.now() + duration, RADIO_CLASS, SimEvent::TxEnd { transmission });
                self.notify(notifications);
            }
            SimEvent::TxEnd { transmission } => {
                let notifications = self.medium.end(transmission);
                self.notify(notifications);
            }
            SimEvent::Traffic { flow } => self.generate(flow),
        }
    }

    fn dispatch(&mut self, node: usize, event: MacEvent) {
        let mut ctx = NodeContext {
            node,
            events: &mut self.events,
            actions: Vec::new(),
        };
        self.nodes[node].mac.handle_event(&mut ctx, event);
        let actions = ctx.actions;
        self.apply(node, actions);
    }

    fn apply(&mut self, node: usize, actions: Vec<NodeAction>) {
        for action in actions {
            match action {
                NodeAction::Transmit(request) => {
                    let start = self.events.now() + request.start_delay;
                    self.events.schedule(start, RADIO_CLASS, SimEvent::TxStart { node, request });
                }
                NodeAction::Tune(frequency_hz) => {
                    let notifications = self.medium.tune(node, frequency_hz);
                    self.notify(notifications);
                }
                NodeAction::Deliver(packet) => {
                    let receiver = &mut self.nodes[node];
                    receiver.delivered += 1;
                    debug!("[{}] delivered packet {} from {}", receiver.node_id, packet.id, packet.source);
                }
            }
        }
    }

    fn notify(&mut self, notifications: Vec<Notification>) {
        let now = self.events.now();
        for (node, event) in notifications {
            let class = event.dispatch_class();
            self.events.schedule(now, class, SimEvent::Mac { node, event });
        }
    }

    /// Emit the next packet of `flow` and schedule the one after.
    fn generate(&mut self, flow_index: usize) {
        let Some(flow) = self.flows.get_mut(flow_index) else {
            return;
        };
        if flow.remaining == Some(0) {
            return;
        }
        if let Some(remaining) = flow.remaining.as_mut() {
            *remaining -= 1;
        }

        let id = self.next_packet_id;
        self.next_packet_id += 1;
        let source = &mut self.nodes[flow.source];
        source.submitted += 1;
        let packet = Packet {
            id,
            source: source.mac.address(),
            destination: flow.destination,
            priority: flow.priority,
            payload_bytes: flow.payload_bytes,
            datarate: flow.datarate,
            tx_power_mw: None,
        };
        let (node, channel, next) = (flow.source, flow.channel, self.events.now() + flow.interval);
        if flow.remaining != Some(0) && next <= self.end {
            self.events.schedule(next, TRAFFIC_CLASS, SimEvent::Traffic { flow: flow_index });
        }
        self.dispatch(node, MacEvent::PacketSubmit { packet, channel });
    }

    fn finish(&mut self) -> SimulationReport {
        let mut reports = Vec::with_capacity(self.nodes.len());
        for (index, node) in self.nodes.iter_mut().enumerate() {
            let mut ctx = NodeContext {
                node: index,
                events: &mut self.events,
                actions: Vec::new(),
            };
            let counters = node.mac.finish(&mut ctx);
            reports.push(NodeReport {
                node_id: node.node_id,
                submitted: node.submitted,
                delivered: node.delivered,
                counters,
            });
        }

        let report = SimulationReport {
            duration_us: self.end.as_micros(),
            events_processed: self.events_processed,
            submitted: reports.iter().map(|node| node.submitted).sum(),
            delivered: reports.iter().map(|node| node.delivered).sum(),
            medium: self.medium.stats(),
            nodes: reports,
        };
        info!(
            "Simulation finished after {} events: {} packets submitted, {} deliveries",
            report.events_processed, report.submitted, report.delivered
        );
        report
    }
}
