//! StateStore: redb-backed state persistence for Keel.
//!
//! Provides typed CRUD operations over providers, formations, layers,
//! nodes, apps, containers and release history. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Operations that must be all-or-nothing (applying a container layout,
//! creating an app with its first release, purging an app) run in a single
//! write transaction. So do check-then-write operations: inserts that must
//! not clobber an existing key, ordinal allocation for new nodes and node
//! state transitions. redb admits one writer at a time, which makes each of
//! these atomic with respect to concurrent requests.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [
            PROVIDERS, FLAVORS, FORMATIONS, LAYERS, NODES, APPS, CONTAINERS, CONFIGS, BUILDS, RELEASES,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn list_prefix<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        scan(&t, prefix)
    }

    /// Insert `value` under `key`, failing with `Conflict` if the key is taken.
    fn insert_new<T: Serialize>(
        &self,
        table: Table,
        kind: &'static str,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            if t.get(key).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict {
                    kind,
                    key: key.to_string(),
                });
            }
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read, change and write back the value under `key` in one write
    /// transaction. Nothing is written when the key is absent or `apply`
    /// returns false.
    fn update<T: Serialize + DeserializeOwned>(
        &self,
        table: Table,
        key: &str,
        apply: impl FnOnce(&mut T) -> bool,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let value = {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let current: Option<T> = match t.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            match current {
                Some(mut value) => {
                    if apply(&mut value) {
                        let bytes = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
                        t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
                    }
                    Some(value)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(value)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Providers ──────────────────────────────────────────────────

    /// Insert or update provider credentials.
    pub fn put_provider(&self, provider: &Provider) -> StateResult<()> {
        let key = provider.table_key();
        self.put(PROVIDERS, &key, provider)?;
        debug!(%key, "provider stored");
        Ok(())
    }

    pub fn get_provider(&self, owner: &str, id: &str) -> StateResult<Option<Provider>> {
        self.get(PROVIDERS, &format!("{owner}/{id}"))
    }

    /// List providers owned by `owner`.
    pub fn list_providers(&self, owner: &str) -> StateResult<Vec<Provider>> {
        self.list_prefix(PROVIDERS, &format!("{owner}/"))
    }

    // ── Flavors ────────────────────────────────────────────────────

    /// Store a new flavor. Fails with `Conflict` if the owner already has one
    /// with this id.
    pub fn insert_flavor(&self, flavor: &Flavor) -> StateResult<()> {
        let key = flavor.table_key();
        self.insert_new(FLAVORS, "flavor", &key, flavor)?;
        debug!(%key, "flavor created");
        Ok(())
    }

    /// Apply `apply` to the stored flavor in one transaction. Returns `None`
    /// if the flavor is gone.
    pub fn update_flavor(
        &self,
        owner: &str,
        id: &str,
        apply: impl FnOnce(&mut Flavor),
    ) -> StateResult<Option<Flavor>> {
        self.update(FLAVORS, &format!("{owner}/{id}"), |flavor| {
            apply(flavor);
            true
        })
    }

    pub fn get_flavor(&self, owner: &str, id: &str) -> StateResult<Option<Flavor>> {
        self.get(FLAVORS, &format!("{owner}/{id}"))
    }

    pub fn list_flavors(&self, owner: &str) -> StateResult<Vec<Flavor>> {
        self.list_prefix(FLAVORS, &format!("{owner}/"))
    }

    pub fn delete_flavor(&self, owner: &str, id: &str) -> StateResult<bool> {
        self.delete(FLAVORS, &format!("{owner}/{id}"))
    }

    // ── Formations ─────────────────────────────────────────────────

    /// Store a new formation. Fails with `Conflict` if the id is taken.
    pub fn insert_formation(&self, formation: &Formation) -> StateResult<()> {
        self.insert_new(FORMATIONS, "formation", &formation.id, formation)?;
        debug!(formation = %formation.id, "formation created");
        Ok(())
    }

    pub fn put_formation(&self, formation: &Formation) -> StateResult<()> {
        self.put(FORMATIONS, &formation.id, formation)?;
        debug!(formation = %formation.id, "formation stored");
        Ok(())
    }

    pub fn get_formation(&self, id: &str) -> StateResult<Option<Formation>> {
        self.get(FORMATIONS, id)
    }

    pub fn list_formations(&self) -> StateResult<Vec<Formation>> {
        self.list_prefix(FORMATIONS, "")
    }

    /// Delete a formation record. Returns true if it existed.
    pub fn delete_formation(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete(FORMATIONS, id)?;
        debug!(formation = %id, existed, "formation deleted");
        Ok(existed)
    }

    // ── Layers ─────────────────────────────────────────────────────

    /// Store a new layer. Fails with `Conflict` if the formation already has
    /// a layer with this id.
    pub fn insert_layer(&self, layer: &Layer) -> StateResult<()> {
        let key = layer.table_key();
        self.insert_new(LAYERS, "layer", &key, layer)?;
        debug!(%key, "layer created");
        Ok(())
    }

    pub fn put_layer(&self, layer: &Layer) -> StateResult<()> {
        let key = layer.table_key();
        self.put(LAYERS, &key, layer)?;
        debug!(%key, "layer stored");
        Ok(())
    }

    pub fn get_layer(&self, formation: &str, layer: &str) -> StateResult<Option<Layer>> {
        self.get(LAYERS, &layer_key(formation, layer))
    }

    pub fn list_layers(&self, formation: &str) -> StateResult<Vec<Layer>> {
        self.list_prefix(LAYERS, &format!("{formation}/"))
    }

    pub fn delete_layer(&self, formation: &str, layer: &str) -> StateResult<bool> {
        self.delete(LAYERS, &layer_key(formation, layer))
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.put(NODES, &node.id, node)
    }

    pub fn get_node(&self, id: &str) -> StateResult<Option<Node>> {
        self.get(NODES, id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list_prefix(NODES, "")
    }

    /// Nodes of a formation, ordered by (layer, num).
    pub fn list_nodes_for_formation(&self, formation: &str) -> StateResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self.list_prefix(NODES, &format!("{formation}."))?;
        nodes.sort_by(|a, b| a.layer.cmp(&b.layer).then(a.num.cmp(&b.num)));
        Ok(nodes)
    }

    /// Nodes of one layer, ordered by num.
    pub fn list_nodes_for_layer(&self, formation: &str, layer: &str) -> StateResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self.list_prefix(NODES, &format!("{formation}.{layer}."))?;
        nodes.sort_by_key(|n| n.num);
        Ok(nodes)
    }

    /// Insert a node under the next free ordinal of its layer.
    ///
    /// `make` builds the record for the allocated ordinal. Allocation, the
    /// fqdn uniqueness check and the insert share one write transaction, so
    /// concurrent callers never get the same ordinal. Fails with `Conflict`
    /// (keyed by fqdn) if the layer already has a node with that fqdn.
    pub fn insert_next_node(
        &self,
        formation: &str,
        layer: &str,
        make: impl FnOnce(u32) -> Node,
    ) -> StateResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node = {
            let mut t = txn.open_table(NODES).map_err(map_err!(Table))?;
            let existing: Vec<Node> = scan(&t, &format!("{formation}.{layer}."))?;
            let num = existing.iter().map(|n| n.num).max().unwrap_or(0) + 1;
            let node = make(num);
            if existing.iter().any(|n| n.fqdn == node.fqdn) {
                return Err(StateError::Conflict {
                    kind: "node",
                    key: node.fqdn,
                });
            }
            let value = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
            t.insert(node.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            node
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %node.id, "node inserted");
        Ok(node)
    }

    /// Read-modify-write one node in a single transaction.
    ///
    /// `apply` returns whether its change should be written. Returns the node
    /// as it stands afterwards, or `None` if the node no longer exists, in
    /// which case nothing is written.
    pub fn update_node(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Node) -> bool,
    ) -> StateResult<Option<Node>> {
        self.update(NODES, id, apply)
    }

    /// Delete a node and unplace every container it hosted, atomically.
    ///
    /// Returns the number of containers that lost their placement.
    pub fn remove_node(&self, id: &str) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let unplaced = {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            nodes.remove(id).map_err(map_err!(Write))?;

            let mut containers = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            let hosted: Vec<Container> = scan::<Container>(&containers, "")?
                .into_iter()
                .filter(|c| c.node.as_deref() == Some(id))
                .collect();
            for mut c in hosted.iter().cloned() {
                c.node = None;
                let value = serde_json::to_vec(&c).map_err(map_err!(Serialize))?;
                containers
                    .insert(c.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            hosted.len() as u32
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %id, unplaced, "node removed");
        Ok(unplaced)
    }

    // ── Apps ───────────────────────────────────────────────────────

    pub fn put_app(&self, app: &App) -> StateResult<()> {
        self.put(APPS, &app.id, app)
    }

    pub fn get_app(&self, id: &str) -> StateResult<Option<App>> {
        self.get(APPS, id)
    }

    pub fn list_apps(&self) -> StateResult<Vec<App>> {
        self.list_prefix(APPS, "")
    }

    pub fn list_apps_for_formation(&self, formation: &str) -> StateResult<Vec<App>> {
        Ok(self
            .list_apps()?
            .into_iter()
            .filter(|a| a.formation == formation)
            .collect())
    }

    /// Store a new app together with its first config and release.
    ///
    /// Fails with `Missing` if the app's formation is gone, `Conflict` if the
    /// app id is taken, and `FormationFull` if the formation has no domain
    /// and already hosts an app. The checks and the writes share one
    /// transaction.
    pub fn create_app(&self, app: &App, config: &Config, release: &Release) -> StateResult<()> {
        let app_value = serde_json::to_vec(app).map_err(map_err!(Serialize))?;
        let config_value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        let release_value = serde_json::to_vec(release).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let formations = txn.open_table(FORMATIONS).map_err(map_err!(Table))?;
            let formation: Formation = match formations
                .get(app.formation.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => {
                    return Err(StateError::Missing {
                        kind: "formation",
                        key: app.formation.clone(),
                    });
                }
            };

            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            if apps.get(app.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict {
                    kind: "app",
                    key: app.id.clone(),
                });
            }
            if !formation.supports_multiple_apps()
                && scan::<App>(&apps, "")?
                    .iter()
                    .any(|a| a.formation == formation.id)
            {
                return Err(StateError::FormationFull(formation.id));
            }
            apps.insert(app.id.as_str(), app_value.as_slice())
                .map_err(map_err!(Write))?;
            let mut configs = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
            configs
                .insert(config.table_key().as_str(), config_value.as_slice())
                .map_err(map_err!(Write))?;
            let mut releases = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            releases
                .insert(release.table_key().as_str(), release_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %app.id, "app created");
        Ok(())
    }

    /// Delete an app and everything that belongs to it.
    pub fn purge_app(&self, id: &str) -> StateResult<bool> {
        let prefix = format!("{id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            existed = apps.remove(id).map_err(map_err!(Write))?.is_some();

            for table in [CONTAINERS, CONFIGS, BUILDS, RELEASES] {
                let mut t = txn.open_table(table).map_err(map_err!(Table))?;
                let keys: Vec<String> = t
                    .iter()
                    .map_err(map_err!(Read))?
                    .filter_map(|entry| {
                        let (key, _) = entry.ok()?;
                        let k = key.value().to_string();
                        k.starts_with(&prefix).then_some(k)
                    })
                    .collect();
                for key in &keys {
                    t.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %id, existed, "app purged");
        Ok(existed)
    }

    // ── Containers ─────────────────────────────────────────────────

    /// Containers of an app, ordered by (type, num).
    pub fn list_containers_for_app(&self, app: &str) -> StateResult<Vec<Container>> {
        self.list_prefix(CONTAINERS, &format!("{app}:"))
    }

    /// Containers of every app in a formation.
    pub fn list_containers_for_formation(&self, formation: &str) -> StateResult<Vec<Container>> {
        Ok(self
            .list_prefix::<Container>(CONTAINERS, "")?
            .into_iter()
            .filter(|c| c.formation == formation)
            .collect())
    }

    pub fn get_container(
        &self,
        app: &str,
        container_type: &str,
        num: u32,
    ) -> StateResult<Option<Container>> {
        self.get(CONTAINERS, &container_key(app, container_type, num))
    }

    /// Upsert and remove containers in one transaction.
    pub fn apply_container_changes(
        &self,
        upserts: &[Container],
        removals: &[String],
    ) -> StateResult<()> {
        let mut encoded = Vec::with_capacity(upserts.len());
        for c in upserts {
            encoded.push((
                c.table_key(),
                serde_json::to_vec(c).map_err(map_err!(Serialize))?,
            ));
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            for key in removals {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for (key, value) in &encoded {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            upserted = upserts.len(),
            removed = removals.len(),
            "container changes applied"
        );
        Ok(())
    }

    /// Commit a scaled app: its new structure plus container changes.
    pub fn commit_app_layout(
        &self,
        app: &App,
        upserts: &[Container],
        removals: &[String],
    ) -> StateResult<()> {
        let app_value = serde_json::to_vec(app).map_err(map_err!(Serialize))?;
        let mut encoded = Vec::with_capacity(upserts.len());
        for c in upserts {
            encoded.push((
                c.table_key(),
                serde_json::to_vec(c).map_err(map_err!(Serialize))?,
            ));
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            apps.insert(app.id.as_str(), app_value.as_slice())
                .map_err(map_err!(Write))?;

            let mut containers = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            for key in removals {
                containers.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for (key, value) in &encoded {
                containers
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            app = %app.id,
            added = upserts.len(),
            removed = removals.len(),
            "app layout committed"
        );
        Ok(())
    }

    // ── Configs / builds / releases ────────────────────────────────

    pub fn latest_config(&self, app: &str) -> StateResult<Option<Config>> {
        Ok(self.list_prefix(CONFIGS, &format!("{app}:"))?.pop())
    }

    pub fn get_build(&self, app: &str, id: &str) -> StateResult<Option<Build>> {
        self.get(BUILDS, &format!("{app}:{id}"))
    }

    pub fn latest_release(&self, app: &str) -> StateResult<Option<Release>> {
        Ok(self.list_prefix(RELEASES, &format!("{app}:"))?.pop())
    }

    pub fn list_releases(&self, app: &str) -> StateResult<Vec<Release>> {
        self.list_prefix(RELEASES, &format!("{app}:"))
    }

    /// Store a new config version and the release it produces.
    pub fn put_config_release(&self, config: &Config, release: &Release) -> StateResult<()> {
        let config_value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        let release_value = serde_json::to_vec(release).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut configs = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
            configs
                .insert(config.table_key().as_str(), config_value.as_slice())
                .map_err(map_err!(Write))?;
            let mut releases = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            releases
                .insert(release.table_key().as_str(), release_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %config.app, version = config.version, "config stored");
        Ok(())
    }

    /// Store a new build and the release it produces.
    pub fn put_build_release(&self, build: &Build, release: &Release) -> StateResult<()> {
        let build_value = serde_json::to_vec(build).map_err(map_err!(Serialize))?;
        let release_value = serde_json::to_vec(release).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut builds = txn.open_table(BUILDS).map_err(map_err!(Table))?;
            builds
                .insert(build.table_key().as_str(), build_value.as_slice())
                .map_err(map_err!(Write))?;
            let mut releases = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            releases
                .insert(release.table_key().as_str(), release_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %build.app, build = %build.id, "build stored");
        Ok(())
    }
}

/// Decode every value under `prefix` from an open table, in key order.
fn scan<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
    }
    Ok(results)
}
