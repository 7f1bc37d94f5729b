//! Discovery of routable tasks from the live cluster state.
//!
//! One pass enumerates every running operation and extracts its endpoint
//! topology. Three operation shapes are recognized, dispatched in order:
//!
//! - A *Spark driver* submitted directly advertises its web UI address in
//!   the `description` annotation (title prefix `Spark driver for`).
//! - A *Spark standalone cluster* (`is_spark` annotation) registers its
//!   master/history endpoints under a discovery path in Cypress.
//! - Any other operation may opt in with a `task_proxy` annotation mapping
//!   `(task, port index)` pairs to named services.
//!
//! A failure to process one operation is logged and skips only that
//! operation; a failure to enumerate operations aborts the pass so the
//! previously published state stays in force.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod annotation;
mod report;
mod spark;
mod task_proxy;

pub use self::{
    annotation::{parse_task_proxy_annotation, TaskServiceInfo},
    report::TaskTable,
};

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::sync::Arc;
use task_proxy_controller_core::{HostPort, TaskList};
use task_proxy_controller_yt_api::{Client, OperationStatus};
use tracing::{debug, error};

const SPARK_DRIVER_TITLE_PREFIX: &str = "Spark driver for";
const OPERATIONS_PAGE_LIMIT: usize = 100;

/// Enumerates running operations and assembles the task set of one pass.
#[derive(Clone, Debug)]
pub struct TaskDiscovery<C> {
    client: Arc<C>,
}

impl<C: Client> TaskDiscovery<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Runs one discovery pass over all running operations.
    pub async fn discover(&self) -> Result<TaskList> {
        // TODO: listing all running operations is inefficient; request only
        // operations carrying a task proxy spec once the scheduler can
        // filter on it.
        let operations = self.list_operations().await?;
        debug!(operations = operations.len(), "found running operations");

        let mut tasks = TaskList::new();
        for op in &operations {
            let discovered = if op.title().starts_with(SPARK_DRIVER_TITLE_PREFIX) {
                spark::direct_submit(op)
            } else if op.annotations().get("is_spark").and_then(Value::as_bool) == Some(true) {
                spark::standalone_cluster(&*self.client, op).await
            } else if let Some(annotation) = op.annotations().get("task_proxy") {
                task_proxy::annotated(&*self.client, op, annotation).await
            } else {
                continue;
            };
            match discovered {
                Ok(discovered) => tasks.extend(discovered),
                Err(error) => {
                    error!(operation = %op.id, "unable to process operation: {error:#}");
                }
            }
        }
        Ok(tasks)
    }

    async fn list_operations(&self) -> Result<Vec<OperationStatus>> {
        let mut operations: Vec<OperationStatus> = Vec::new();
        let mut cursor = None;
        loop {
            debug!(
                limit = OPERATIONS_PAGE_LIMIT,
                ?cursor,
                loaded = operations.len(),
                "loading running operations chunk"
            );
            let page = self
                .client
                .list_operations(cursor, OPERATIONS_PAGE_LIMIT)
                .await
                .context("failed to list operations")?;
            let short = page.len() < OPERATIONS_PAGE_LIMIT;
            operations.extend(page);
            if short {
                break;
            }
            cursor = operations.last().map(|op| op.start_time);
        }
        Ok(operations)
    }
}

/// Splits a discovery entry of the form `host:port`.
fn parse_host_port(node: &str) -> Result<HostPort> {
    let (host, port) = node
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("address {node:?} is missing a port"))?;
    let port = port
        .parse::<u32>()
        .with_context(|| format!("address {node:?} has a malformed port"))?;
    Ok(HostPort {
        host: host.to_string(),
        port,
    })
}
