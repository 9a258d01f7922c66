//! Layout computation: turn an app's requested container counts into
//! the minimal set of container additions and removals.
//!
//! 1. Types scaled down lose their highest ordinals first.
//! 2. Types scaled up gain the missing ordinals in `1..=count`, each
//!    assigned to the least-loaded eligible node at the time of the
//!    assignment (load counts every app in the formation).
//! 3. Types absent from the request are left alone.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use keel_state::{App, Container};

use crate::error::{PlacementError, PlacementResult};
use crate::scorer::{NodeLoads, Topology};

/// Container operations needed to reach a requested structure.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LayoutPlan {
    pub to_add: Vec<Container>,
    pub to_remove: Vec<Container>,
}

impl LayoutPlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Store keys of the containers to remove.
    pub fn removal_keys(&self) -> Vec<String> {
        self.to_remove.iter().map(Container::table_key).collect()
    }
}

/// Compute the layout plan for `app` given the formation's current containers.
///
/// Fails with `NoEligibleNode` when any type needs additions and no active
/// node accepts it; in that case no partial plan is returned.
pub fn compute_layout(
    topology: &Topology,
    formation_containers: &[Container],
    app: &App,
    requested: &BTreeMap<String, u32>,
    now: u64,
) -> PlacementResult<LayoutPlan> {
    let mut loads = NodeLoads::from_containers(formation_containers);
    let mut plan = LayoutPlan::default();

    for (container_type, &count) in requested {
        let mut existing: Vec<&Container> = formation_containers
            .iter()
            .filter(|c| c.app == app.id && &c.container_type == container_type)
            .collect();
        existing.sort_by(|a, b| b.num.cmp(&a.num));

        let present: BTreeSet<u32> = existing.iter().map(|c| c.num).collect();
        let missing: Vec<u32> = (1..=count).filter(|n| !present.contains(n)).collect();

        if !missing.is_empty() && !topology.has_candidate(container_type) {
            return Err(PlacementError::NoEligibleNode {
                container_type: container_type.clone(),
            });
        }

        for c in existing.iter().filter(|c| c.num > count) {
            if let Some(node) = &c.node {
                loads.remove(node);
            }
            plan.to_remove.push((*c).clone());
        }

        for num in missing {
            let node = loads
                .least_loaded(topology.candidates(container_type))
                .map(str::to_string);
            if let Some(node) = &node {
                loads.add(node);
            }
            debug!(
                app = %app.id,
                container_type = %container_type,
                num,
                node = ?node,
                "assigned container"
            );
            plan.to_add.push(Container {
                app: app.id.clone(),
                formation: app.formation.clone(),
                owner: app.owner.clone(),
                container_type: container_type.clone(),
                num,
                node,
                created_at: now,
            });
        }
    }

    Ok(plan)
}
