use crate::parse_host_port;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use task_proxy_controller_core::{HostPort, Protocol, Task};
use task_proxy_controller_yt_api::{Client, OperationStatus};
use tracing::debug;

/// Spark master/history endpoints registered under the cluster discovery
/// path. The history server is optionally enabled in the spark conf.
const SUB_TASKS: [(&str, &str, &str); 3] = [
    ("master", "webui", "ui"),
    ("master", "rest", "rest"),
    ("history", "shs", "ui"),
];

fn description(op: &OperationStatus) -> Result<&Value> {
    op.annotations()
        .get("description")
        .ok_or_else(|| anyhow!("no description in operation annotations"))
}

/// A directly submitted Spark driver advertises one web UI address in its
/// description annotation.
pub(crate) fn direct_submit(op: &OperationStatus) -> Result<Vec<Task>> {
    let web_ui = description(op)?
        .get("Web UI")
        .ok_or_else(|| anyhow!("no Web UI in description"))?
        .as_str()
        .ok_or_else(|| anyhow!("Web UI is not a string"))?;

    let url = url::Url::parse(web_ui).context("invalid web UI url in description")?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("web UI url {web_ui:?} has no host"))?;
    let port = url
        .port()
        .ok_or_else(|| anyhow!("web UI url {web_ui:?} has no port"))?;

    Ok(vec![Task {
        operation_id: op.id.clone(),
        operation_alias: None,
        task_name: "driver".to_string(),
        service: "ui".to_string(),
        protocol: Protocol::Http,
        jobs: vec![HostPort {
            host: host.to_string(),
            port: port.into(),
        }],
    }])
}

/// A standalone Spark cluster registers each component's `host:port` as
/// child nodes of its discovery path.
pub(crate) async fn standalone_cluster<C: Client>(
    client: &C,
    op: &OperationStatus,
) -> Result<Vec<Task>> {
    let discovery_path = description(op)?
        .get("Spark over YT")
        .ok_or_else(|| anyhow!("no Spark over YT in description"))?
        .get("discovery_path")
        .ok_or_else(|| anyhow!("no discovery_path in Spark over YT"))?
        .as_str()
        .ok_or_else(|| anyhow!("discovery_path is not a string"))?;

    let mut tasks = Vec::new();
    for (task_name, dir, service) in SUB_TASKS {
        let path = format!("{discovery_path}/discovery/{dir}");
        let nodes = match client.list_node(&path).await {
            Ok(nodes) => nodes,
            Err(error) if task_name == "history" => {
                debug!(operation = %op.id, "no history server registered: {error:#}");
                continue;
            }
            Err(error) => {
                return Err(error.context(format!(
                    "failed to list nodes in discovery path for task {task_name:?}"
                )))
            }
        };

        let mut jobs = Vec::new();
        for node in &nodes {
            jobs.push(parse_host_port(node)?);
        }

        tasks.push(Task {
            operation_id: op.id.clone(),
            operation_alias: None,
            task_name: task_name.to_string(),
            service: service.to_string(),
            protocol: Protocol::Http,
            jobs,
        });
    }
    Ok(tasks)
}
