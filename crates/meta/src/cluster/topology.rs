//! Per-cluster topology view
//!
//! `Cluster` caches the cluster's nodes, shards and tables together with the
//! store revision each was read at. Reads are served from the cache under a
//! read lock and never block each other. Writes go to the store first as a
//! compare-and-set against the cached revision and are applied to the cache
//! only once committed; a rejected write reloads the cache from the store and
//! surfaces as `MetaError::Conflict` so the caller can retry on fresh state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::route::{RouteEntry, RouteTablesResult};
use crate::error::{MetaError, Result};
use crate::metadata::{
    validate_name, ClusterInfo, NodeInfo, NodeName, ShardId, ShardInfo, TableInfo,
};
use crate::storage::{encode, keys, Revision, StoreError, TopologyStore};

#[derive(Debug, Clone)]
struct Entry<T> {
    revision: Revision,
    /// View version at which this entry was applied
    applied: u64,
    value: T,
}

/// (schema, table)
type TableKey = (String, String);

fn table_key(schema: &str, table: &str) -> TableKey {
    (schema.to_string(), table.to_string())
}

#[derive(Debug, Default)]
struct ClusterView {
    /// Bumped on every change applied to this view
    version: u64,
    nodes: BTreeMap<NodeName, Entry<NodeInfo>>,
    shards: BTreeMap<ShardId, Entry<ShardInfo>>,
    tables: BTreeMap<TableKey, Entry<TableInfo>>,
    /// Tables dropped through this view: last known revision and the view
    /// version of the drop
    dropped: BTreeMap<TableKey, (Revision, u64)>,
}

/// Insert `value` unless the map already holds a newer revision
fn put_entry<K: Ord, T>(
    map: &mut BTreeMap<K, Entry<T>>,
    version: &mut u64,
    key: K,
    revision: Revision,
    value: T,
) {
    if map.get(&key).map_or(true, |e| e.revision < revision) {
        *version += 1;
        map.insert(
            key,
            Entry {
                revision,
                applied: *version,
                value,
            },
        );
    }
}

/// Merge a scan started at view version `started` into `cached`
///
/// Newer revisions win. A cached entry missing from the scan is removed only
/// if it was applied before the scan started. Returns whether anything changed.
fn merge_entries<K: Ord, T>(
    cached: &mut BTreeMap<K, Entry<T>>,
    fresh: BTreeMap<K, Entry<T>>,
    started: u64,
    applied: u64,
    skip: impl Fn(&K, Revision) -> bool,
) -> bool {
    let before = cached.len();
    cached.retain(|key, entry| entry.applied > started || fresh.contains_key(key));
    let mut changed = cached.len() != before;

    for (key, entry) in fresh {
        if skip(&key, entry.revision) {
            continue;
        }
        if cached.get(&key).map_or(true, |e| e.revision < entry.revision) {
            cached.insert(key, Entry { applied, ..entry });
            changed = true;
        }
    }
    changed
}

impl ClusterView {
    fn put_node(&mut self, revision: Revision, node: NodeInfo) {
        let key = node.name.clone();
        put_entry(&mut self.nodes, &mut self.version, key, revision, node);
    }

    fn put_shard(&mut self, revision: Revision, shard: ShardInfo) {
        put_entry(&mut self.shards, &mut self.version, shard.id, revision, shard);
    }

    fn put_table(&mut self, revision: Revision, table: TableInfo) {
        let key = table_key(&table.schema, &table.name);
        self.dropped.remove(&key);
        put_entry(&mut self.tables, &mut self.version, key, revision, table);
    }

    /// Forget a table; `deleted` is the revision of the record removed from
    /// the store, if known
    fn remove_table(&mut self, schema: &str, table: &str, deleted: Option<Revision>) {
        let key = table_key(schema, table);
        let cached = self.tables.remove(&key).map(|e| e.revision);
        if cached.is_some() {
            self.version += 1;
        }
        if let Some(revision) = cached.max(deleted) {
            self.dropped.insert(key, (revision, self.version));
        }
    }

    fn table(&self, schema: &str, table: &str) -> Option<&Entry<TableInfo>> {
        self.tables.get(&table_key(schema, table))
    }

    fn all_tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values().map(|e| &e.value)
    }

    /// Fold in a view loaded from the store, keeping local commits that
    /// landed while it was being read
    fn merge(&mut self, fresh: ClusterView, started: u64) {
        self.dropped
            .retain(|key, (_, at)| *at > started || fresh.tables.contains_key(key));

        let applied = self.version + 1;
        let dropped = &self.dropped;
        let mut changed =
            merge_entries(&mut self.nodes, fresh.nodes, started, applied, |_, _| false);
        changed |= merge_entries(&mut self.shards, fresh.shards, started, applied, |_, _| false);
        changed |= merge_entries(
            &mut self.tables,
            fresh.tables,
            started,
            applied,
            |key, revision| dropped.get(key).map_or(false, |(at, _)| *at >= revision),
        );

        if changed {
            self.version = applied;
        }
    }
}

/// Cached, versioned view of one cluster
pub struct Cluster {
    name: String,
    store: Arc<dyn TopologyStore>,
    view: RwLock<ClusterView>,
}

impl Cluster {
    /// Load the cluster from the store, `None` if it was never created
    pub(crate) async fn load(store: Arc<dyn TopologyStore>, name: &str) -> Result<Option<Self>> {
        let Some(record) = store.get(&keys::cluster(name)).await? else {
            return Ok(None);
        };
        let info: ClusterInfo = record.decode()?;
        let view = load_view(store.as_ref(), name).await?;

        info!(
            "Loaded cluster {}: {} nodes, {} shards",
            info.name,
            view.nodes.len(),
            view.shards.len()
        );

        Ok(Some(Self {
            name: info.name,
            store,
            view: RwLock::new(view),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring the view up to date with the store
    ///
    /// Commits made through this view while the store is being read are kept.
    pub async fn refresh(&self) -> Result<()> {
        let started = self.view.read().version;
        let fresh = load_view(self.store.as_ref(), self.name()).await?;
        self.view.write().merge(fresh, started);
        debug!("Refreshed view of cluster {}", self.name());
        Ok(())
    }

    // ==================== Queries ====================

    pub fn node(&self, name: &str) -> Result<NodeInfo> {
        self.view
            .read()
            .nodes
            .get(name)
            .map(|e| e.value.clone())
            .ok_or_else(|| MetaError::NodeNotFound(name.to_string()))
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.view.read().nodes.values().map(|e| e.value.clone()).collect()
    }

    pub fn shard(&self, shard_id: ShardId) -> Result<ShardInfo> {
        self.view
            .read()
            .shards
            .get(&shard_id)
            .map(|e| e.value.clone())
            .ok_or(MetaError::ShardNotFound(shard_id))
    }

    pub fn shards(&self) -> Vec<ShardInfo> {
        self.view.read().shards.values().map(|e| e.value.clone()).collect()
    }

    pub fn table(&self, schema: &str, table: &str) -> Result<TableInfo> {
        self.view
            .read()
            .table(schema, table)
            .map(|e| e.value.clone())
            .ok_or_else(|| MetaError::table_not_found(schema, table))
    }

    /// Tables currently assigned to `shard_id`
    pub fn shard_tables(&self, shard_id: ShardId) -> Vec<TableInfo> {
        self.view
            .read()
            .all_tables()
            .filter(|t| t.shard_id == shard_id)
            .cloned()
            .collect()
    }

    /// Table names per shard
    ///
    /// An empty `shard_ids` selects every shard. A non-empty `node_name`
    /// keeps only shards with a replica on that node. Unknown shard IDs are
    /// skipped.
    pub fn get_shard_tables(
        &self,
        shard_ids: &[ShardId],
        node_name: &str,
    ) -> BTreeMap<ShardId, Vec<String>> {
        let view = self.view.read();

        let selected: Vec<&ShardInfo> = if shard_ids.is_empty() {
            view.shards.values().map(|e| &e.value).collect()
        } else {
            shard_ids
                .iter()
                .filter_map(|id| view.shards.get(id).map(|e| &e.value))
                .collect()
        };

        let mut result: BTreeMap<ShardId, Vec<String>> = selected
            .into_iter()
            .filter(|shard| node_name.is_empty() || shard.is_hosted_on(node_name))
            .map(|shard| (shard.id, Vec::new()))
            .collect();

        for table in view.all_tables() {
            if let Some(names) = result.get_mut(&table.shard_id) {
                names.push(table.name.clone());
            }
        }
        for names in result.values_mut() {
            names.sort();
        }

        result
    }

    /// Resolve tables to their shard and that shard's leader
    pub fn route_tables(&self, schema: &str, tables: &[String]) -> RouteTablesResult {
        let view = self.view.read();
        let mut entries = BTreeMap::new();

        for name in tables {
            let Some(table) = view.table(schema, name) else {
                debug!("Route skipped unknown table {}.{}", schema, name);
                continue;
            };
            let table = &table.value;
            let Some(shard) = view.shards.get(&table.shard_id) else {
                warn!(
                    "Table {}.{} points at missing shard {}",
                    schema, name, table.shard_id
                );
                continue;
            };
            let shard = &shard.value;
            let node_addr = view
                .nodes
                .get(&shard.leader)
                .map(|e| e.value.addr.clone())
                .unwrap_or_default();

            entries.insert(
                name.clone(),
                RouteEntry {
                    table: name.clone(),
                    table_id: table.id,
                    shard_id: shard.id,
                    shard_version: shard.version,
                    node_name: shard.leader.clone(),
                    node_addr,
                },
            );
        }

        RouteTablesResult {
            cluster_version: view.version,
            entries,
        }
    }

    // ==================== Mutations ====================

    /// Allocate a fresh shard ID from the durable counter
    pub async fn alloc_shard_id(&self) -> Result<ShardId> {
        let key = keys::shard_id_counter(self.name());
        let next = self.store.increment(&key).await?;
        let shard_id =
            ShardId::try_from(next).map_err(|_| StoreError::CounterOverflow(key.clone()))?;
        info!("Allocated shard id {} in cluster {}", shard_id, self.name());
        Ok(shard_id)
    }

    /// Register a node, or update its address
    pub async fn register_node(&self, name: &str, addr: &str) -> Result<NodeInfo> {
        validate_name("node", name)?;

        let existing = self.view.read().nodes.get(name).cloned();
        let (expected, node) = match existing {
            Some(e) if e.value.addr == addr => return Ok(e.value),
            Some(e) => (
                Some(e.revision),
                NodeInfo {
                    addr: addr.to_string(),
                    ..e.value
                },
            ),
            None => (None, NodeInfo::new(name.to_string(), addr.to_string())),
        };

        let revision = self
            .cas(&keys::node(self.name(), name), expected, &node)
            .await?;
        self.view.write().put_node(revision, node.clone());

        info!("Registered node {} in cluster {}", node, self.name());
        Ok(node)
    }

    /// Create a shard with a freshly allocated ID
    pub async fn create_shard(&self, leader: &str, replicas: Vec<NodeName>) -> Result<ShardInfo> {
        self.node(leader)?;
        for replica in &replicas {
            self.node(replica)?;
        }

        let shard_id = self.alloc_shard_id().await?;
        let shard = ShardInfo::new(shard_id, leader.to_string(), replicas);
        let revision = self
            .cas(&keys::shard(self.name(), shard_id), None, &shard)
            .await?;
        self.view.write().put_shard(revision, shard.clone());

        info!("Created {} in cluster {}", shard, self.name());
        Ok(shard)
    }

    /// Create the record of an already allocated shard, unless it exists
    pub async fn ensure_shard(&self, shard_id: ShardId, leader: &str) -> Result<ShardInfo> {
        if let Ok(shard) = self.shard(shard_id) {
            return Ok(shard);
        }
        self.node(leader)?;

        let shard = ShardInfo::new(shard_id, leader.to_string(), Vec::new());
        let revision = self
            .cas(&keys::shard(self.name(), shard_id), None, &shard)
            .await?;
        self.view.write().put_shard(revision, shard.clone());

        info!("Created {} in cluster {}", shard, self.name());
        Ok(shard)
    }

    /// Move shard leadership from `expected_leader` to `new_leader`
    ///
    /// Succeeds without writing if `new_leader` already leads the shard, so a
    /// re-executed commit is harmless.
    pub async fn update_shard_leader(
        &self,
        shard_id: ShardId,
        expected_leader: &str,
        new_leader: &str,
    ) -> Result<ShardInfo> {
        let entry = self
            .view
            .read()
            .shards
            .get(&shard_id)
            .cloned()
            .ok_or(MetaError::ShardNotFound(shard_id))?;

        if entry.value.leader == new_leader {
            return Ok(entry.value);
        }
        if entry.value.leader != expected_leader {
            return Err(MetaError::Validation(format!(
                "shard {} is led by {}, not {}",
                shard_id, entry.value.leader, expected_leader
            )));
        }
        self.node(new_leader)?;

        let next = entry.value.with_leader(new_leader.to_string());
        let revision = self
            .cas(&keys::shard(self.name(), shard_id), Some(entry.revision), &next)
            .await?;
        self.view.write().put_shard(revision, next.clone());

        info!(
            "Shard {} leader {} -> {} (version {})",
            shard_id, expected_leader, new_leader, next.version
        );
        Ok(next)
    }

    /// Create a table on `shard_id`, or on the shard with the fewest tables
    pub async fn create_table(
        &self,
        schema: &str,
        table: &str,
        shard_id: Option<ShardId>,
    ) -> Result<TableInfo> {
        validate_name("schema", schema)?;
        validate_name("table", table)?;

        if self.view.read().table(schema, table).is_some() {
            return Err(MetaError::AlreadyExists(format!("table {}.{}", schema, table)));
        }

        let shard_id = match shard_id {
            Some(id) => self.shard(id)?.id,
            None => self.least_loaded_shard()?,
        };

        let table_id = self
            .store
            .increment(&keys::table_id_counter(self.name()))
            .await?;
        let info = TableInfo::new(table_id, schema.to_string(), table.to_string(), shard_id);
        let revision = self
            .cas(&keys::table(self.name(), schema, table), None, &info)
            .await?;
        self.view.write().put_table(revision, info.clone());

        info!(
            "Created table {}.{} (id={}) on shard {}",
            schema, table, table_id, shard_id
        );
        Ok(info)
    }

    /// Reassign a table from shard `from` to shard `to`
    ///
    /// Succeeds without writing if the table is already on `to`.
    pub async fn move_table(
        &self,
        schema: &str,
        table: &str,
        from: ShardId,
        to: ShardId,
    ) -> Result<TableInfo> {
        let entry = self
            .view
            .read()
            .table(schema, table)
            .cloned()
            .ok_or_else(|| MetaError::table_not_found(schema, table))?;

        if entry.value.shard_id == to {
            return Ok(entry.value);
        }
        if entry.value.shard_id != from {
            return Err(MetaError::Validation(format!(
                "table {}.{} is on shard {}, not {}",
                schema, table, entry.value.shard_id, from
            )));
        }
        self.shard(to)?;

        let next = entry.value.reassigned(to);
        let revision = self
            .cas(
                &keys::table(self.name(), schema, table),
                Some(entry.revision),
                &next,
            )
            .await?;
        self.view.write().put_table(revision, next.clone());

        info!("Moved table {}.{}: shard {} -> {}", schema, table, from, to);
        Ok(next)
    }

    /// Drop a table's shard assignment
    ///
    /// Idempotent: returns `Ok(false)` if the table does not exist. The
    /// existence check reads the store, not the cached view.
    pub async fn drop_table(&self, schema: &str, table: &str) -> Result<bool> {
        let key = keys::table(self.name(), schema, table);

        let Some(current) = self.store.get(&key).await? else {
            self.view.write().remove_table(schema, table, None);
            info!("Drop table {}.{}: already absent", schema, table);
            return Ok(false);
        };

        match self.store.compare_and_delete(&key, current.revision).await {
            Ok(()) => {
                self.view.write().remove_table(schema, table, Some(current.revision));
                info!("Dropped table {}.{}", schema, table);
                Ok(true)
            }
            Err(StoreError::Conflict { actual: None, .. }) => {
                self.view.write().remove_table(schema, table, Some(current.revision));
                Ok(false)
            }
            Err(err) => {
                if matches!(err, StoreError::Conflict { .. }) {
                    self.refresh().await?;
                }
                Err(err.into())
            }
        }
    }

    fn least_loaded_shard(&self) -> Result<ShardId> {
        let view = self.view.read();
        let mut counts: HashMap<ShardId, usize> =
            view.shards.keys().map(|id| (*id, 0)).collect();
        for table in view.all_tables() {
            if let Some(count) = counts.get_mut(&table.shard_id) {
                *count += 1;
            }
        }

        counts
            .into_iter()
            .min_by_key(|(id, count)| (*count, *id))
            .map(|(id, _)| id)
            .ok_or_else(|| {
                MetaError::Validation(format!("cluster {} has no shards", self.name()))
            })
    }

    /// Compare-and-set a record; a rejected write reloads the view
    async fn cas<T: Serialize>(
        &self,
        key: &str,
        expected: Option<Revision>,
        value: &T,
    ) -> Result<Revision> {
        match self.store.compare_and_set(key, expected, encode(value)?).await {
            Ok(revision) => Ok(revision),
            Err(err @ StoreError::Conflict { .. }) => {
                warn!("Stale write on {}, reloading cluster {}", key, self.name());
                self.refresh().await?;
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

async fn load_view(store: &dyn TopologyStore, cluster: &str) -> Result<ClusterView> {
    let mut view = ClusterView::default();

    for (_, record) in store.scan_prefix(&keys::nodes_prefix(cluster)).await? {
        let node: NodeInfo = record.decode()?;
        view.put_node(record.revision, node);
    }
    for (_, record) in store.scan_prefix(&keys::shards_prefix(cluster)).await? {
        let shard: ShardInfo = record.decode()?;
        view.put_shard(record.revision, shard);
    }
    for (_, record) in store.scan_prefix(&keys::tables_prefix(cluster)).await? {
        let table: TableInfo = record.decode()?;
        view.put_table(record.revision, table);
    }

    Ok(view)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::storage::{MemoryStore, StoreResult, Versioned};

    async fn new_cluster(store: Arc<dyn TopologyStore>) -> Cluster {
        let info = ClusterInfo::new("c".to_string());
        store
            .compare_and_set(&keys::cluster("c"), None, encode(&info).unwrap())
            .await
            .unwrap();
        Cluster::load(store, "c").await.unwrap().unwrap()
    }

    async fn seeded() -> Cluster {
        let cluster = new_cluster(Arc::new(MemoryStore::new())).await;
        cluster.register_node("a", "127.0.0.1:9001").await.unwrap();
        cluster.register_node("b", "127.0.0.1:9002").await.unwrap();
        let shard = cluster.create_shard("a", vec!["b".into()]).await.unwrap();
        for t in ["t1", "t2", "t3"] {
            cluster.create_table("public", t, Some(shard.id)).await.unwrap();
        }
        cluster
    }

    #[tokio::test]
    async fn test_get_shard_tables_filters_by_node() {
        let cluster = seeded().await;
        let other = cluster.create_shard("b", vec![]).await.unwrap();

        let all = cluster.get_shard_tables(&[], "");
        assert_eq!(all.len(), 2);
        assert_eq!(all[&1], vec!["t1", "t2", "t3"]);
        assert!(all[&other.id].is_empty());

        let on_a = cluster.get_shard_tables(&[1, other.id], "a");
        assert_eq!(on_a.keys().copied().collect::<Vec<_>>(), vec![1]);

        let unknown = cluster.get_shard_tables(&[99], "");
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn test_route_tables_skips_unknown() {
        let cluster = seeded().await;
        let result = cluster.route_tables("public", &["t1".to_string(), "nope".to_string()]);

        assert_eq!(result.entries.len(), 1);
        let entry = &result.entries["t1"];
        assert_eq!(entry.shard_id, 1);
        assert_eq!(entry.node_name, "a");
        assert_eq!(entry.node_addr, "127.0.0.1:9001");
    }

    #[tokio::test]
    async fn test_update_leader_checks_expected_and_is_idempotent() {
        let cluster = seeded().await;

        assert!(matches!(
            cluster.update_shard_leader(1, "b", "a").await,
            Ok(ref s) if s.leader == "a" && s.version == 0
        ));
        assert!(matches!(
            cluster.update_shard_leader(1, "b", "c").await,
            Err(MetaError::Validation(_))
        ));

        let shard = cluster.update_shard_leader(1, "a", "b").await.unwrap();
        assert_eq!(shard.leader, "b");
        assert_eq!(shard.version, 1);

        let again = cluster.update_shard_leader(1, "a", "b").await.unwrap();
        assert_eq!(again.version, 1);
    }

    #[tokio::test]
    async fn test_stale_view_write_is_rejected_then_refreshed() {
        let store: Arc<dyn TopologyStore> = Arc::new(MemoryStore::new());
        let cluster = new_cluster(store.clone()).await;
        cluster.register_node("a", "x:1").await.unwrap();
        cluster.register_node("b", "x:2").await.unwrap();
        let shard = cluster.create_shard("a", vec![]).await.unwrap();

        // A second view over the same store commits first
        let other = Cluster::load(store.clone(), "c").await.unwrap().unwrap();
        other.update_shard_leader(shard.id, "a", "b").await.unwrap();

        // The first view still believes "a" leads: its write must not land
        let err = cluster
            .move_table_leader_stale(shard.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::Conflict(_)));

        // After the conflict the view has been reloaded
        assert_eq!(cluster.shard(shard.id).unwrap().leader, "b");
    }

    impl Cluster {
        /// Write through the cached revision even though it is outdated
        async fn move_table_leader_stale(&self, shard_id: ShardId) -> Result<Revision> {
            let entry = self.view.read().shards.get(&shard_id).cloned().unwrap();
            let next = entry.value.with_leader("a".to_string());
            self.cas(&keys::shard(self.name(), shard_id), Some(entry.revision), &next)
                .await
        }
    }

    /// Holds the next tables scan after reading it, until released
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStore,
        armed: AtomicBool,
        scanned: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TopologyStore for GatedStore {
        async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
            self.inner.get(key).await
        }

        async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Versioned)>> {
            let out = self.inner.scan_prefix(prefix).await;
            if prefix.contains("/tables/") && self.armed.swap(false, Ordering::SeqCst) {
                self.scanned.notify_one();
                self.release.notified().await;
            }
            out
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<Revision>,
            value: serde_json::Value,
        ) -> StoreResult<Revision> {
            self.inner.compare_and_set(key, expected, value).await
        }

        async fn compare_and_delete(&self, key: &str, expected: Revision) -> StoreResult<()> {
            self.inner.compare_and_delete(key, expected).await
        }

        async fn increment(&self, key: &str) -> StoreResult<u64> {
            self.inner.increment(key).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_keeps_commits_made_during_the_scan() {
        let store = Arc::new(GatedStore::default());
        let cluster = Arc::new(new_cluster(store.clone()).await);
        cluster.register_node("a", "x:1").await.unwrap();
        cluster.register_node("b", "x:2").await.unwrap();
        cluster.create_shard("a", vec!["b".into()]).await.unwrap();
        cluster.create_table("public", "t1", Some(1)).await.unwrap();

        store.armed.store(true, Ordering::SeqCst);
        let refreshing = tokio::spawn({
            let cluster = cluster.clone();
            async move { cluster.refresh().await }
        });
        store.scanned.notified().await;

        // The scan in flight predates all of these
        let shard = cluster.update_shard_leader(1, "a", "b").await.unwrap();
        cluster.create_table("public", "t2", Some(1)).await.unwrap();
        assert!(cluster.drop_table("public", "t1").await.unwrap());

        store.release.notify_one();
        refreshing.await.unwrap().unwrap();

        let route = cluster.route_tables("public", &["t1".to_string(), "t2".to_string()]);
        assert_eq!(route.entries.len(), 1);
        assert_eq!(route.entries["t2"].node_name, "b");
        assert_eq!(route.entries["t2"].shard_version, shard.version);

        // The cache still knows b leads
        assert!(matches!(
            cluster.update_shard_leader(1, "a", "c").await,
            Err(MetaError::Validation(_))
        ));

        cluster.refresh().await.unwrap();
        assert_eq!(cluster.shard(1).unwrap().leader, "b");
        assert!(cluster.table("public", "t1").is_err());
        assert!(cluster.table("public", "t2").is_ok());
    }

    #[tokio::test]
    async fn test_refresh_drops_tables_deleted_elsewhere() {
        let store: Arc<dyn TopologyStore> = Arc::new(MemoryStore::new());
        let cluster = new_cluster(store.clone()).await;
        cluster.register_node("a", "x:1").await.unwrap();
        cluster.create_shard("a", vec![]).await.unwrap();
        cluster.create_table("public", "t1", Some(1)).await.unwrap();

        let other = Cluster::load(store, "c").await.unwrap().unwrap();
        assert!(other.drop_table("public", "t1").await.unwrap());
        other.create_table("public", "t1", Some(1)).await.unwrap();
        let recreated = other.table("public", "t1").unwrap();

        cluster.refresh().await.unwrap();
        assert_eq!(cluster.table("public", "t1").unwrap().id, recreated.id);

        assert!(other.drop_table("public", "t1").await.unwrap());
        cluster.refresh().await.unwrap();
        assert!(cluster.table("public", "t1").is_err());
    }

    #[tokio::test]
    async fn test_move_table() {
        let cluster = seeded().await;
        let target = cluster.create_shard("b", vec![]).await.unwrap();

        let moved = cluster.move_table("public", "t1", 1, target.id).await.unwrap();
        assert_eq!(moved.shard_id, target.id);
        assert_eq!(moved.version, 1);

        // Re-executing the same move is a no-op
        let again = cluster.move_table("public", "t1", 1, target.id).await.unwrap();
        assert_eq!(again.version, 1);

        assert!(matches!(
            cluster.move_table("public", "t2", target.id, 1).await,
            Err(MetaError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_table_is_idempotent() {
        let cluster = seeded().await;

        assert!(cluster.drop_table("public", "t1").await.unwrap());
        assert!(!cluster.drop_table("public", "t1").await.unwrap());
        assert!(!cluster.drop_table("public", "never").await.unwrap());
        assert!(cluster.table("public", "t1").is_err());
    }

    #[tokio::test]
    async fn test_create_table_picks_least_loaded_shard() {
        let cluster = seeded().await;
        let empty = cluster.create_shard("b", vec![]).await.unwrap();

        let table = cluster.create_table("public", "t4", None).await.unwrap();
        assert_eq!(table.shard_id, empty.id);

        assert!(matches!(
            cluster.create_table("public", "t4", None).await,
            Err(MetaError::AlreadyExists(_))
        ));
    }
}
