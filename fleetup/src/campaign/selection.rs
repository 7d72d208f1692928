//! Phase sizing and node selection

use std::collections::HashSet;

use crate::campaign::inventory::FleetNode;
use crate::utils::sha256_hex;

/// Nodes a phase must have covered once it completes: `ceil(pct * total / 100)`
pub fn phase_target_count(percentage: f64, total_nodes: u64) -> u64 {
    if total_nodes == 0 || percentage <= 0.0 {
        return 0;
    }
    // Guard against float noise pushing an exact product over the next integer.
    let exact = percentage * total_nodes as f64 / 100.0;
    let target = (exact - 1e-9).ceil().max(0.0) as u64;
    target.min(total_nodes)
}

/// Nodes sorted by a consistent hash of their id
pub fn stable_order(nodes: &[FleetNode]) -> Vec<FleetNode> {
    let mut keyed: Vec<(String, &FleetNode)> = nodes
        .iter()
        .map(|node| (sha256_hex(node.node_id.as_bytes()), node))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.node_id.cmp(&b.1.node_id)));
    keyed.into_iter().map(|(_, node)| node.clone()).collect()
}

/// Take up to `count` nodes from `ordered`, skipping excluded ids
pub fn select<'a>(
    ordered: &'a [FleetNode],
    excluded: &HashSet<String>,
    count: u64,
) -> Vec<&'a FleetNode> {
    ordered
        .iter()
        .filter(|node| !excluded.contains(&node.node_id))
        .take(count as usize)
        .collect()
}
