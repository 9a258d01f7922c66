//! Databag rendering: the JSON document every node converges against.
//!
//! The databag is a pure function of stored state: formation, layers with
//! their nodes, and for each app its latest release, config, image and
//! container placement.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use keel_state::{App, Formation, NodeState, StateStore};

use crate::error::OrchestratorResult;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Databag {
    pub formation: String,
    pub domain: Option<String>,
    pub layers: BTreeMap<String, LayerBag>,
    pub apps: BTreeMap<String, AppBag>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LayerBag {
    pub runtime: bool,
    pub proxy: bool,
    pub ssh_username: String,
    /// Node id → node facts.
    pub nodes: BTreeMap<String, NodeBag>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NodeBag {
    pub fqdn: String,
    pub state: NodeState,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AppBag {
    pub id: String,
    /// `{app}.{domain}` when the formation has a domain.
    pub domain: Option<String>,
    pub release: Option<u32>,
    pub config: BTreeMap<String, Value>,
    pub image: Option<String>,
    pub structure: BTreeMap<String, u32>,
    /// Container type → ordinal → fqdn of the hosting node (null if unplaced).
    pub containers: BTreeMap<String, BTreeMap<u32, Option<String>>>,
}

/// Render the databag of a formation.
pub fn render(store: &StateStore, formation: &Formation) -> OrchestratorResult<Databag> {
    let nodes = store.list_nodes_for_formation(&formation.id)?;
    let fqdns: BTreeMap<&str, &str> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.fqdn.as_str()))
        .collect();

    let mut layers = BTreeMap::new();
    for layer in store.list_layers(&formation.id)? {
        let layer_nodes = nodes
            .iter()
            .filter(|n| n.layer == layer.id)
            .map(|n| {
                (
                    n.id.clone(),
                    NodeBag {
                        fqdn: n.fqdn.clone(),
                        state: n.state,
                    },
                )
            })
            .collect();
        layers.insert(
            layer.id.clone(),
            LayerBag {
                runtime: layer.runtime,
                proxy: layer.proxy,
                ssh_username: layer.ssh_username.clone(),
                nodes: layer_nodes,
            },
        );
    }

    let mut apps = BTreeMap::new();
    for app in store.list_apps_for_formation(&formation.id)? {
        let bag = render_app_with(store, formation, &app, &fqdns)?;
        apps.insert(app.id.clone(), bag);
    }

    Ok(Databag {
        formation: formation.id.clone(),
        domain: formation.domain.clone(),
        layers,
        apps,
    })
}

/// Render the databag section of a single app.
pub fn render_app(store: &StateStore, formation: &Formation, app: &App) -> OrchestratorResult<AppBag> {
    let nodes = store.list_nodes_for_formation(&formation.id)?;
    let fqdns: BTreeMap<&str, &str> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.fqdn.as_str()))
        .collect();
    render_app_with(store, formation, app, &fqdns)
}

fn render_app_with(
    store: &StateStore,
    formation: &Formation,
    app: &App,
    fqdns: &BTreeMap<&str, &str>,
) -> OrchestratorResult<AppBag> {
    let release = store.latest_release(&app.id)?;
    let config = store
        .latest_config(&app.id)?
        .map(|c| c.values)
        .unwrap_or_default();
    let image = match release.as_ref().and_then(|r| r.build.as_deref()) {
        Some(build) => store.get_build(&app.id, build)?.map(|b| b.image),
        None => None,
    };

    let mut containers: BTreeMap<String, BTreeMap<u32, Option<String>>> = BTreeMap::new();
    for c in store.list_containers_for_app(&app.id)? {
        let fqdn = c
            .node
            .as_deref()
            .and_then(|n| fqdns.get(n))
            .map(|f| f.to_string());
        containers
            .entry(c.container_type.clone())
            .or_default()
            .insert(c.num, fqdn);
    }

    Ok(AppBag {
        id: app.id.clone(),
        domain: formation
            .domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(|d| format!("{}.{d}", app.id)),
        release: release.map(|r| r.version),
        config,
        image,
        structure: app.structure.clone(),
        containers,
    })
}
