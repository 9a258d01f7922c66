//! Node eligibility and load accounting for placement decisions.
//!
//! A node is eligible for a container type when it is active (`up`, or
//! `converging`, which returns to `up`) and its layer accepts the type
//! (runtime layer, and the type is listed or the layer lists none). Load is the number of containers placed on a node, across
//! every app of the formation.

use std::collections::{BTreeMap, HashMap};

use keel_state::{Container, Layer, Node, NodeId};

/// Snapshot of the placement-relevant parts of one formation.
#[derive(Debug, Clone)]
pub struct Topology {
    layers: HashMap<String, Layer>,
    /// Active nodes, ordered by id.
    active_nodes: Vec<Node>,
}

impl Topology {
    pub fn new(nodes: &[Node], layers: &[Layer]) -> Self {
        let layers = layers
            .iter()
            .map(|l| (l.id.clone(), l.clone()))
            .collect();
        let mut active_nodes: Vec<Node> = nodes
            .iter()
            .filter(|n| n.state.is_active())
            .cloned()
            .collect();
        active_nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            layers,
            active_nodes,
        }
    }

    /// Whether `node_id` may host a container of `container_type`.
    pub fn is_eligible(&self, node_id: &str, container_type: &str) -> bool {
        self.active_nodes
            .iter()
            .any(|n| n.id == node_id && self.layer_accepts(n, container_type))
    }

    /// Eligible node ids for `container_type`, in id order.
    pub fn candidates<'s>(&'s self, container_type: &str) -> impl Iterator<Item = &'s str> {
        self.active_nodes
            .iter()
            .filter(move |n| self.layer_accepts(n, container_type))
            .map(|n| n.id.as_str())
    }

    pub fn has_candidate(&self, container_type: &str) -> bool {
        self.candidates(container_type).next().is_some()
    }

    /// Ids of every active node, in id order.
    pub fn active_node_ids(&self) -> impl Iterator<Item = &str> {
        self.active_nodes.iter().map(|n| n.id.as_str())
    }

    fn layer_accepts(&self, node: &Node, container_type: &str) -> bool {
        self.layers
            .get(&node.layer)
            .is_some_and(|l| l.accepts(container_type))
    }
}

/// Per-node container counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeLoads(BTreeMap<NodeId, u32>);

impl NodeLoads {
    /// Count the placed containers of a formation.
    pub fn from_containers(containers: &[Container]) -> Self {
        let mut loads = BTreeMap::new();
        for c in containers {
            if let Some(node) = &c.node {
                *loads.entry(node.clone()).or_insert(0) += 1;
            }
        }
        Self(loads)
    }

    pub fn get(&self, node_id: &str) -> u32 {
        self.0.get(node_id).copied().unwrap_or(0)
    }

    pub fn add(&mut self, node_id: &str) {
        *self.0.entry(node_id.to_string()).or_insert(0) += 1;
    }

    pub fn remove(&mut self, node_id: &str) {
        if let Some(load) = self.0.get_mut(node_id) {
            *load = load.saturating_sub(1);
        }
    }

    /// The least-loaded node among `candidates`. Ties go to the lowest id.
    pub fn least_loaded<'a>(&self, candidates: impl Iterator<Item = &'a str>) -> Option<&'a str> {
        candidates.min_by(|a, b| self.get(a).cmp(&self.get(b)).then(a.cmp(b)))
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use keel_state::NodeState;

    #[test]
    fn only_active_nodes_of_accepting_layers_are_candidates() {
        let layers = vec![layer("runtime", &[]), layer("workers", &["worker"])];
        let nodes = vec![
            node("runtime", 1, NodeState::Up),
            node("runtime", 2, NodeState::Down),
            node("runtime", 3, NodeState::Building),
            node("workers", 1, NodeState::Converging),
        ];
        let topo = Topology::new(&nodes, &layers);

        let web: Vec<&str> = topo.candidates("web").collect();
        assert_eq!(web, vec!["dev.runtime.1"]);

        let worker: Vec<&str> = topo.candidates("worker").collect();
        assert_eq!(worker, vec!["dev.runtime.1", "dev.workers.1"]);

        assert!(!topo.is_eligible("dev.runtime.2", "web"));
        assert!(!topo.is_eligible("dev.runtime.3", "web"));
        assert!(topo.is_eligible("dev.workers.1", "worker"));
        assert!(!topo.is_eligible("dev.workers.1", "web"));
    }

    #[test]
    fn non_runtime_layer_hosts_nothing() {
        let mut proxy = layer("proxy", &[]);
        proxy.runtime = false;
        let nodes = vec![node("proxy", 1, NodeState::Up)];
        let topo = Topology::new(&nodes, &[proxy]);
        assert!(!topo.has_candidate("web"));
    }

    #[test]
    fn least_loaded_breaks_ties_by_lowest_id() {
        let containers = vec![
            container("a", "web", 1, Some("n1")),
            container("b", "web", 1, Some("n1")),
            container("a", "web", 2, Some("n3")),
        ];
        let loads = NodeLoads::from_containers(&containers);
        assert_eq!(loads.get("n1"), 2);
        assert_eq!(loads.get("n2"), 0);

        let pick = loads.least_loaded(["n3", "n2", "n1"].into_iter());
        assert_eq!(pick, Some("n2"));

        let pick = loads.least_loaded(["n3", "n1"].into_iter());
        assert_eq!(pick, Some("n3"));
    }
}
