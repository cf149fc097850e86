//! Scenario loading and validation.
//!
//! A scenario is a JSON file listing the nodes of the network and the
//! periodic traffic flows between them:
//!
//! ```json
//! {
//!   "seed": 42,
//!   "duration_ms": 1000,
//!   "nodes": [{ "node_id": 1 }, { "node_id": 2, "start_us": 250 }],
//!   "flows": [
//!     { "source": 1, "priority": 6, "payload_bytes": 200, "interval_us": 100000 },
//!     { "source": 2, "destination": 1, "payload_bytes": 500, "interval_us": 20000, "channel": "service" }
//!   ]
//! }
//! ```
//!
//! A flow without `destination` broadcasts.

use anyhow::{Context, anyhow};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;

use crate::mac::ChannelKind;

/// Largest MSDU an 802.11 frame can carry.
pub const MAX_PAYLOAD_BYTES: u32 = 2304;

const MAX_NODES: usize = 10_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// Master seed; every node derives its random streams from it.
    #[serde(default)]
    pub seed: u64,
    pub duration_ms: u64,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub flows: Vec<FlowSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub node_id: u32,
    /// When the node's MAC comes up.
    #[serde(default)]
    pub start_us: u64,
}

fn default_channel() -> ChannelKind {
    ChannelKind::Control
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowSpec {
    pub source: u32,
    /// Unicast target; broadcast when absent.
    #[serde(default)]
    pub destination: Option<u32>,
    /// 802.1D user priority.
    #[serde(default)]
    pub priority: u8,
    pub payload_bytes: u32,
    pub interval_us: u64,
    #[serde(default)]
    pub start_us: u64,
    /// Stop after this many packets.
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default = "default_channel")]
    pub channel: ChannelKind,
    /// Per-packet bit rate override.
    #[serde(default)]
    pub datarate: Option<u64>,
}

/// Load and validate a scenario file.
///
/// # Parameters
///
/// * `path` - Path to the scenario JSON file
///
/// # Returns
///
/// The parsed scenario, or an error describing the first problem found.
pub fn load_scenario(path: &str) -> anyhow::Result<Scenario> {
    let data = fs::read_to_string(path).with_context(|| format!("Failed to read file: {}", path))?;
    let scenario: Scenario = serde_json::from_str(&data).context("Invalid JSON format")?;
    validate_scenario(&scenario).map_err(|e| anyhow!("Validation error: {}", e))?;
    Ok(scenario)
}

/// Check a parsed scenario for inconsistencies.
///
/// # Returns
///
/// `Ok(())` if validation passes, `Err(String)` with error description otherwise.
pub fn validate_scenario(scenario: &Scenario) -> Result<(), String> {
    if scenario.duration_ms == 0 {
        return Err("Scenario duration must be positive".to_string());
    }
    if scenario.nodes.is_empty() {
        return Err("Scenario must contain at least one node".to_string());
    }
    if scenario.nodes.len() > MAX_NODES {
        return Err(format!("Node count {} exceeds maximum of {}", scenario.nodes.len(), MAX_NODES));
    }

    let mut node_ids = HashSet::new();
    for node in &scenario.nodes {
        if !node_ids.insert(node.node_id) {
            return Err(format!("Duplicate node_id found: {}", node.node_id));
        }
    }

    for (index, flow) in scenario.flows.iter().enumerate() {
        let Some(source) = scenario.nodes.iter().find(|node| node.node_id == flow.source) else {
            return Err(format!("Flow {} has unknown source node {}", index, flow.source));
        };
        if let Some(destination) = flow.destination {
            if !node_ids.contains(&destination) {
                return Err(format!("Flow {} has unknown destination node {}", index, destination));
            }
            if destination == flow.source {
                return Err(format!("Flow {} sends to its own source {}", index, destination));
            }
        }
        if flow.priority > 7 {
            return Err(format!("Flow {} priority {} outside 0-7", index, flow.priority));
        }
        if flow.payload_bytes == 0 || flow.payload_bytes > MAX_PAYLOAD_BYTES {
            return Err(format!("Flow {} payload {} bytes outside 1-{}", index, flow.payload_bytes, MAX_PAYLOAD_BYTES));
        }
        if flow.interval_us == 0 {
            return Err(format!("Flow {} interval must be positive", index));
        }
        if flow.start_us < source.start_us {
            return Err(format!(
                "Flow {} starts at {} us, before its source node comes up at {} us",
                index, flow.start_us, source.start_us
            ));
        }
    }

    Ok(())
}
