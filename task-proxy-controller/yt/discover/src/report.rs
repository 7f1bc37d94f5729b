use anyhow::Result;
use std::sync::Arc;
use task_proxy_controller_core::{hash_domain, Registry, TaskRow};
use task_proxy_controller_yt_api::Client;
use tracing::debug;

/// Writes the advisory reporting table: one row per published task with its
/// public domain. The table is observational; serving never depends on it.
#[derive(Clone, Debug)]
pub struct TaskTable<C> {
    client: Arc<C>,
    path: String,
    base_domain: String,
}

impl<C: Client> TaskTable<C> {
    pub fn new(client: Arc<C>, path: String, base_domain: String) -> Self {
        Self {
            client,
            path,
            base_domain,
        }
    }

    /// Truncates and rewrites the table from the registry, creating it on
    /// first use. Readers can observe an empty table mid-write.
    pub async fn save(&self, registry: &Registry) -> Result<()> {
        if !self.client.node_exists(&self.path).await? {
            self.client.create_table(&self.path).await?;
        }

        let rows: Vec<TaskRow> = registry
            .iter()
            .map(|(fingerprint, task)| TaskRow {
                operation_id: task.operation_id.clone(),
                task_name: task.task_name.clone(),
                service: task.service.clone(),
                protocol: task.protocol.to_string(),
                domain: hash_domain(fingerprint, &self.base_domain),
            })
            .collect();

        debug!(rows = rows.len(), path = %self.path, "saving task table");
        self.client.write_table(&self.path, &rows).await
    }
}
