use crate::annotation::parse_task_proxy_annotation;
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use task_proxy_controller_core::{HostPort, Protocol, Task};
use task_proxy_controller_yt_api::{Client, OperationStatus};

/// An operation that opted in with a `task_proxy` annotation. Every port a
/// running job exposes becomes a service: either the one the annotation
/// names for its `(task, index)` pair, or a synthesized `port_{i}` HTTP
/// service for ports the annotation does not cover.
pub(crate) async fn annotated<C: Client>(
    client: &C,
    op: &OperationStatus,
    annotation: &Value,
) -> Result<Vec<Task>> {
    let Some(services) = parse_task_proxy_annotation(annotation) else {
        bail!("invalid task_proxy annotation: {annotation}");
    };

    let jobs = client
        .list_jobs(&op.id)
        .await
        .context("failed to list jobs")?;

    let mut by_id: HashMap<String, Task> = HashMap::new();
    for job in &jobs {
        let ports_path = format!(
            "//sys/exec_nodes/{}/orchid/exec_node/job_controller/active_jobs/{}/job_ports",
            job.address, job.id,
        );
        let ports: Vec<u32> = client
            .get_node(&ports_path)
            .await
            .and_then(|value| serde_json::from_value(value).map_err(Into::into))
            .with_context(|| format!("failed to list job {:?} ports", job.id))?;

        // The job address carries the exec node's own port.
        let host = job.address.split(':').next().unwrap_or(&job.address);

        for (i, port) in ports.iter().enumerate() {
            let (service, protocol) = services
                .iter()
                .find(|info| info.task == job.task_name && info.port_index == i)
                .map(|info| (info.service.clone(), info.protocol))
                .unwrap_or_else(|| (format!("port_{i}"), Protocol::Http));

            let task = Task {
                operation_id: op.id.clone(),
                operation_alias: None,
                task_name: job.task_name.clone(),
                service,
                protocol,
                jobs: Vec::new(),
            };
            by_id
                .entry(task.id())
                .or_insert(task)
                .jobs
                .push(HostPort {
                    host: host.to_string(),
                    port: *port,
                });
        }
    }

    Ok(by_id.into_values().collect())
}
