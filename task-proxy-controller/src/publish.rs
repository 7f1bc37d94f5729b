use anyhow::{Context, Result};
use std::{path::Path, sync::Arc};
use task_proxy_controller_core::{Registry, SharedRegistry};
use task_proxy_controller_grpc::{
    snapshot::{make_snapshot, TLS_CRT_PATH, TLS_KEY_PATH},
    SnapshotCache, NODE_ID,
};
use task_proxy_controller_yt_api::Client;
use task_proxy_controller_yt_discover::{TaskDiscovery, TaskTable};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

/// Drives the discovery loop: one pass per tick, a publication only when
/// the discovered set actually changed.
pub struct Publisher<C> {
    discovery: TaskDiscovery<C>,
    table: TaskTable<C>,
    registry: SharedRegistry,
    cache: Arc<SnapshotCache>,
    base_domain: String,
    auth_enabled: bool,
    version: Option<String>,
}

impl<C: Client> Publisher<C> {
    pub fn new(
        discovery: TaskDiscovery<C>,
        table: TaskTable<C>,
        registry: SharedRegistry,
        cache: Arc<SnapshotCache>,
        base_domain: String,
        auth_enabled: bool,
    ) -> Self {
        Self {
            discovery,
            table,
            registry,
            cache,
            base_domain,
            auth_enabled,
            version: None,
        }
    }

    /// Runs until the process exits. The first pass starts immediately;
    /// passes never overlap, and a failed pass leaves the previously
    /// published state in force until the next tick retries.
    pub async fn run(mut self, refresh_period: Duration) {
        loop {
            if let Err(error) = self.pass().await {
                error!("discovery pass failed: {error:#}");
            }
            time::sleep(refresh_period).await;
        }
    }

    async fn pass(&mut self) -> Result<()> {
        let tasks = self.discovery.discover().await?;

        let registry = Arc::new(Registry::new(tasks));
        if self.version.as_deref() == Some(registry.version()) {
            debug!("no changes in discovered tasks");
            return Ok(());
        }
        info!(
            tasks = registry.len(),
            version = registry.version(),
            "discovered task set changed",
        );

        // TLS material can appear or rotate while the process runs.
        let tls = Path::new(TLS_CRT_PATH).exists() && Path::new(TLS_KEY_PATH).exists();
        let snapshot = make_snapshot(&registry, &self.base_domain, tls, self.auth_enabled)
            .context("failed to make snapshot")?;

        // The authorizer must know every task the proxy can route before the
        // proxy learns the route, so the registry swap comes first.
        self.registry.store(registry.clone());
        self.cache.set_snapshot(NODE_ID, snapshot);
        self.version = Some(registry.version().to_string());

        if let Err(error) = self.table.save(&registry).await {
            error!("failed to save tasks to the table: {error:#}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use task_proxy_controller_yt_api::{
        Credentials, JobInfo, OperationId, OperationStatus, Permission, PermissionCheck,
        RuntimeParameters, TaskRow, WhoAmI,
    };

    #[derive(Default)]
    struct MockClient {
        operations: Mutex<Vec<OperationStatus>>,
        fail_listing: Mutex<bool>,
        written: Mutex<Vec<Vec<TaskRow>>>,
        existing: Mutex<bool>,
    }

    impl MockClient {
        fn set_operations(&self, operations: Vec<OperationStatus>) {
            *self.operations.lock() = operations;
        }
    }

    #[async_trait::async_trait]
    impl Client for MockClient {
        async fn list_operations(
            &self,
            _cursor: Option<chrono::DateTime<chrono::Utc>>,
            _limit: usize,
        ) -> Result<Vec<OperationStatus>> {
            if *self.fail_listing.lock() {
                anyhow::bail!("cluster unavailable");
            }
            Ok(self.operations.lock().clone())
        }

        async fn list_jobs(&self, _operation_id: &str) -> Result<Vec<JobInfo>> {
            Ok(Vec::new())
        }

        async fn get_node(&self, _path: &str) -> Result<Value> {
            anyhow::bail!("no such node")
        }

        async fn list_node(&self, _path: &str) -> Result<Vec<String>> {
            anyhow::bail!("no such node")
        }

        async fn node_exists(&self, _path: &str) -> Result<bool> {
            Ok(*self.existing.lock())
        }

        async fn create_table(&self, _path: &str) -> Result<()> {
            *self.existing.lock() = true;
            Ok(())
        }

        async fn write_table(&self, _path: &str, rows: &[TaskRow]) -> Result<()> {
            self.written.lock().push(rows.to_vec());
            Ok(())
        }

        async fn who_am_i(&self, _credentials: &Credentials) -> Result<WhoAmI> {
            unreachable!("publication never resolves identities")
        }

        async fn check_operation_permission(
            &self,
            _operation_id: &OperationId,
            _user: &str,
            _permission: Permission,
        ) -> Result<PermissionCheck> {
            unreachable!("publication never checks permissions")
        }
    }

    fn driver_op(id: &str, host: &str) -> OperationStatus {
        OperationStatus {
            id: id.to_string(),
            start_time: chrono::Utc::now(),
            brief_spec: json!({"title": format!("Spark driver for {id}")}),
            runtime_parameters: RuntimeParameters {
                annotations: json!({"description": {"Web UI": format!("http://{host}:4040/")}}),
            },
        }
    }

    fn publisher(client: Arc<MockClient>) -> (Publisher<MockClient>, SharedRegistry, Arc<SnapshotCache>) {
        let registry = SharedRegistry::new();
        let cache = Arc::new(SnapshotCache::new());
        let publisher = Publisher::new(
            TaskDiscovery::new(client.clone()),
            TaskTable::new(client, "//tmp/services".to_string(), "proxy.example".to_string()),
            registry.clone(),
            cache.clone(),
            "proxy.example".to_string(),
            true,
        );
        (publisher, registry, cache)
    }

    #[tokio::test]
    async fn publishes_registry_before_snapshot_and_reports() {
        let client = Arc::new(MockClient::default());
        client.set_operations(vec![driver_op("op1", "h1.example")]);
        let (mut publisher, registry, cache) = publisher(client.clone());

        publisher.pass().await.unwrap();

        let published = registry.load();
        assert_eq!(published.len(), 1);
        let snapshot = cache.current(NODE_ID).unwrap();
        assert_eq!(snapshot.version(), published.version());
        assert_eq!(client.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn unchanged_passes_skip_publication() {
        let client = Arc::new(MockClient::default());
        client.set_operations(vec![driver_op("op1", "h1.example")]);
        let (mut publisher, _registry, cache) = publisher(client.clone());

        publisher.pass().await.unwrap();
        let version = cache.current(NODE_ID).unwrap().version().to_string();

        publisher.pass().await.unwrap();
        assert_eq!(cache.current(NODE_ID).unwrap().version(), version);
        // The reporting table was written exactly once.
        assert_eq!(client.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn changed_job_set_republishes() {
        let client = Arc::new(MockClient::default());
        client.set_operations(vec![driver_op("op1", "h1.example")]);
        let (mut publisher, _registry, cache) = publisher(client.clone());
        publisher.pass().await.unwrap();
        let before = cache.current(NODE_ID).unwrap().version().to_string();

        // The driver moved to another host: same task id, new version.
        client.set_operations(vec![driver_op("op1", "h2.example")]);
        publisher.pass().await.unwrap();
        let after = cache.current(NODE_ID).unwrap().version().to_string();
        assert_ne!(before, after);
        assert_eq!(client.written.lock().len(), 2);
    }

    #[tokio::test]
    async fn failed_pass_preserves_published_state() {
        let client = Arc::new(MockClient::default());
        client.set_operations(vec![driver_op("op1", "h1.example")]);
        let (mut publisher, registry, cache) = publisher(client.clone());
        publisher.pass().await.unwrap();

        *client.fail_listing.lock() = true;
        assert!(publisher.pass().await.is_err());

        assert_eq!(registry.load().len(), 1);
        assert!(cache.current(NODE_ID).is_some());

        // Recovery on a later tick picks up the current state.
        *client.fail_listing.lock() = false;
        client.set_operations(Vec::new());
        publisher.pass().await.unwrap();
        assert!(registry.load().is_empty());
    }
}
