use envoy_types::pb::google::protobuf::Any;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;
use tracing::info;

/// An immutable configuration bundle: every resource of every type, already
/// encoded, stamped with one version.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    version: String,
    resources: HashMap<&'static str, Vec<Any>>,
}

impl Snapshot {
    pub fn new(version: impl Into<String>, clusters: Vec<Any>, listeners: Vec<Any>) -> Self {
        Self {
            version: version.into(),
            resources: HashMap::from([
                (crate::snapshot::CLUSTER_TYPE_URL, clusters),
                (crate::snapshot::LISTENER_TYPE_URL, listeners),
            ]),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Resources of one type, or an empty slice for types this snapshot
    /// does not carry.
    pub fn resources(&self, type_url: &str) -> &[Any] {
        self.resources
            .get(type_url)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn has(&self, type_url: &str) -> bool {
        self.resources.contains_key(type_url)
    }
}

type SnapshotTx = watch::Sender<Option<Arc<Snapshot>>>;
type SnapshotRx = watch::Receiver<Option<Arc<Snapshot>>>;

/// Holds the latest snapshot per node id and fans installs out to every
/// connected stream.
///
/// Installing a snapshot atomically replaces the node's current one;
/// subscribers observe the new version on their next stream iteration and
/// new subscribers receive the current snapshot immediately. There is no
/// per-session state beyond the node id.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    nodes: Mutex<HashMap<String, SnapshotTx>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot(&self, node_id: &str, snapshot: Snapshot) {
        info!(node_id, version = snapshot.version(), "installing snapshot");
        let mut nodes = self.nodes.lock();
        node(&mut nodes, node_id).send_replace(Some(Arc::new(snapshot)));
    }

    /// Subscribes to a node's snapshots. The receiver immediately holds the
    /// current snapshot, if one was ever installed.
    pub fn subscribe(&self, node_id: &str) -> SnapshotRx {
        let mut nodes = self.nodes.lock();
        node(&mut nodes, node_id).subscribe()
    }

    /// The currently installed snapshot for a node.
    pub fn current(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        self.nodes
            .lock()
            .get(node_id)
            .and_then(|tx| tx.borrow().clone())
    }
}

fn node<'n>(
    nodes: &'n mut HashMap<String, SnapshotTx>,
    node_id: &str,
) -> &'n mut SnapshotTx {
    nodes
        .entry(node_id.to_string())
        .or_insert_with(|| watch::channel(None).0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{CLUSTER_TYPE_URL, LISTENER_TYPE_URL};

    fn snapshot(version: &str) -> Snapshot {
        Snapshot::new(version, Vec::new(), Vec::new())
    }

    #[test]
    fn current_is_none_until_first_install() {
        let cache = SnapshotCache::new();
        assert!(cache.current("id").is_none());

        cache.set_snapshot("id", snapshot("aaaa0000"));
        assert_eq!(cache.current("id").unwrap().version(), "aaaa0000");
    }

    #[test]
    fn install_replaces_whole_snapshot() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("id", snapshot("aaaa0000"));
        cache.set_snapshot("id", snapshot("bbbb1111"));
        assert_eq!(cache.current("id").unwrap().version(), "bbbb1111");
    }

    #[test]
    fn nodes_are_isolated() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("id", snapshot("aaaa0000"));
        assert!(cache.current("other").is_none());
    }

    #[tokio::test]
    async fn subscribers_see_installs() {
        let cache = SnapshotCache::new();
        let mut rx = cache.subscribe("id");
        assert!(rx.borrow().is_none());

        cache.set_snapshot("id", snapshot("aaaa0000"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().version(), "aaaa0000");

        cache.set_snapshot("id", snapshot("bbbb1111"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().version(), "bbbb1111");
    }

    #[test]
    fn unknown_types_have_no_resources() {
        let snap = snapshot("aaaa0000");
        assert!(snap.has(CLUSTER_TYPE_URL));
        assert!(snap.has(LISTENER_TYPE_URL));
        assert!(!snap.has("type.googleapis.com/envoy.config.route.v3.RouteConfiguration"));
        assert!(snap
            .resources("type.googleapis.com/envoy.config.route.v3.RouteConfiguration")
            .is_empty());
    }
}
