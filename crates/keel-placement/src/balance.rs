//! Balancing: reassign containers without changing any counts.
//!
//! Two passes:
//! 1. Containers whose node is no longer eligible (down, gone, unplaced, or
//!    its layer stopped accepting the type) move to the least-loaded
//!    eligible node, when one exists.
//! 2. While some node carries at least two more containers than an eligible
//!    peer, one container moves from the busier node to the idler one.
//!
//! Every move in pass 2 strictly lowers the sum of squared loads, so the
//! loop terminates, and a balanced formation produces an empty plan.

use serde::Serialize;
use tracing::debug;

use keel_state::Container;

use crate::scorer::{NodeLoads, Topology};

/// Containers whose placement changed, with their new node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BalancePlan {
    pub moved: Vec<Container>,
    /// Containers left unplaced because no eligible node exists.
    pub stranded: u32,
}

impl BalancePlan {
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty()
    }
}

/// Compute a balance plan for every container of a formation.
pub fn balance(topology: &Topology, containers: &[Container]) -> BalancePlan {
    let mut current: Vec<Container> = containers.to_vec();
    current.sort_by_key(Container::table_key);

    let mut loads = NodeLoads::from_containers(
        &current
            .iter()
            .filter(|c| placed_eligibly(topology, c))
            .cloned()
            .collect::<Vec<_>>(),
    );
    let mut changed = vec![false; current.len()];
    let mut stranded = 0;

    // Pass 1: stranded containers.
    for (idx, c) in current.iter_mut().enumerate() {
        if placed_eligibly(topology, c) {
            continue;
        }
        match loads.least_loaded(topology.candidates(&c.container_type)) {
            Some(node) => {
                debug!(container = %c.label(), from = ?c.node, to = %node, "re-placing container");
                loads.add(node);
                c.node = Some(node.to_string());
                changed[idx] = true;
            }
            None => stranded += 1,
        }
    }

    // Pass 2: level the load.
    while let Some((idx, target)) = next_move(topology, &current, &loads) {
        let c = &mut current[idx];
        if let Some(from) = &c.node {
            loads.remove(from);
        }
        loads.add(&target);
        debug!(container = %c.label(), from = ?c.node, to = %target, "moving container");
        c.node = Some(target);
        changed[idx] = true;
    }

    let moved = current
        .into_iter()
        .zip(changed)
        .filter(|(c, changed)| {
            *changed
                && containers
                    .iter()
                    .find(|orig| orig.table_key() == c.table_key())
                    .is_none_or(|orig| orig.node != c.node)
        })
        .map(|(c, _)| c)
        .collect();

    BalancePlan { moved, stranded }
}

fn placed_eligibly(topology: &Topology, c: &Container) -> bool {
    c.node
        .as_deref()
        .is_some_and(|n| topology.is_eligible(n, &c.container_type))
}

/// Find one container to move from a busy node to a node at least two lighter.
///
/// Sources are tried busiest first (ties by lowest id); within a source,
/// containers in key order; the destination is the least-loaded eligible node.
fn next_move(
    topology: &Topology,
    containers: &[Container],
    loads: &NodeLoads,
) -> Option<(usize, String)> {
    let mut sources: Vec<&str> = topology.active_node_ids().collect();
    sources.sort_by(|a, b| loads.get(b).cmp(&loads.get(a)).then(a.cmp(b)));

    for source in sources {
        let source_load = loads.get(source);
        if source_load < 2 {
            break;
        }
        for (idx, c) in containers.iter().enumerate() {
            if c.node.as_deref() != Some(source) || !topology.is_eligible(source, &c.container_type)
            {
                continue;
            }
            let target = loads.least_loaded(
                topology
                    .candidates(&c.container_type)
                    .filter(|n| *n != source),
            );
            match target {
                Some(target) if loads.get(target) + 2 <= source_load => {
                    return Some((idx, target.to_string()));
                }
                _ => {}
            }
        }
    }
    None
}
