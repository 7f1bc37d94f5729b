//! Task model shared by discovery, the snapshot builder, and the
//! authorization server.
//!
//! A [`Task`] is one routable endpoint group belonging to a cluster
//! operation: the `(operation, task role, service role)` triple plus the
//! `(host, port)` pairs of its currently live jobs. Tasks are identified by
//! the concatenation of those three fields; the last 8 hex characters of the
//! identity's SHA-256 become the task's public subdomain label and the
//! routing key handed to the edge proxy.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod registry;

pub use self::registry::{Registry, SharedRegistry};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Upstream protocol spoken by a task's endpoints.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Grpc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("unknown protocol {0:?}")]
pub struct UnknownProtocol(pub String);

impl std::str::FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "grpc" => Ok(Protocol::Grpc),
            _ => Err(UnknownProtocol(s.to_string())),
        }
    }
}

/// One live job replica endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u32,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A named, routable endpoint group belonging to one cluster operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub operation_id: String,
    /// Short user-chosen operation name. Discovery does not emit aliases
    /// yet; when set it gates [`Task::validate`] and enables the
    /// alias-based domain form.
    pub operation_alias: Option<String>,
    pub task_name: String,
    pub service: String,
    pub protocol: Protocol,
    pub jobs: Vec<HostPort>,
}

impl Task {
    /// Identifies the task, for sorting and the domain hash.
    pub fn id(&self) -> String {
        format!("{}{}{}", self.operation_id, self.task_name, self.service)
    }

    /// Identity extended with the job `(host, port)`s, so that the published
    /// version changes when jobs move between hosts.
    pub fn id_with_host_port(&self) -> String {
        let mut out = self.id();
        for job in &self.jobs {
            out.push_str(&job.host);
            out.push_str(&job.port.to_string());
        }
        out
    }

    /// Alias-based domains share one namespace, so the fields composing them
    /// are restricted to `[a-z0-9]+`. Tasks without an alias are exempt.
    pub fn validate(&self) -> Result<(), InvalidField> {
        let Some(alias) = &self.operation_alias else {
            return Ok(());
        };
        for (name, value) in [
            ("operation_alias", alias.as_str()),
            ("task_name", self.task_name.as_str()),
            ("service", self.service.as_str()),
        ] {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) {
                return Err(InvalidField {
                    field: name,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} ({})",
            self.operation_id, self.task_name, self.service, self.protocol
        )?;
        for job in &self.jobs {
            write!(f, " {job}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("field {field:?} value {value:?} does not match ^[a-z0-9]+$")]
pub struct InvalidField {
    pub field: &'static str,
    pub value: String,
}

/// The discovered task set of one pass, ordered by [`Task::id`] once
/// [`sort`](TaskList::sort) has run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskList(Vec<Task>);

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.0.push(task);
    }

    pub fn sort(&mut self) {
        self.0.sort_by_key(|t| t.id());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Task> {
        self.0.iter()
    }
}

impl Extend<Task> for TaskList {
    fn extend<I: IntoIterator<Item = Task>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl FromIterator<Task> for TaskList {
    fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for TaskList {
    type Item = Task;
    type IntoIter = std::vec::IntoIter<Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for TaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for task in &self.0 {
            writeln!(f, "\t{task}")?;
        }
        Ok(())
    }
}

/// Last 8 hex characters of the SHA-256 of `source`.
///
/// Used both per task (the subdomain label) and over the whole sorted task
/// set (the published version).
pub fn fingerprint(source: &[u8]) -> String {
    let hex = hex::encode(Sha256::digest(source));
    hex[hex.len() - 8..].to_string()
}

/// Public domain of a task, `{fingerprint}.{base_domain}`.
pub fn hash_domain(fingerprint: &str, base_domain: &str) -> String {
    format!("{fingerprint}.{base_domain}")
}

/// Alias-based domain form, `{alias}-{task}-{service}.{base_domain}`.
/// Only meaningful for validated tasks carrying an alias.
pub fn alias_domain(task: &Task, base_domain: &str) -> Option<String> {
    let alias = task.operation_alias.as_deref()?;
    Some(format!(
        "{alias}-{}-{}.{base_domain}",
        task.task_name, task.service
    ))
}

/// Persisted projection of one task, written to the reporting table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRow {
    pub operation_id: String,
    pub task_name: String,
    pub service: String,
    pub protocol: String,
    pub domain: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(operation_id: &str, task_name: &str, service: &str, jobs: &[(&str, u32)]) -> Task {
        Task {
            operation_id: operation_id.to_string(),
            operation_alias: None,
            task_name: task_name.to_string(),
            service: service.to_string(),
            protocol: Protocol::Http,
            jobs: jobs
                .iter()
                .map(|(host, port)| HostPort {
                    host: host.to_string(),
                    port: *port,
                })
                .collect(),
        }
    }

    #[test]
    fn id_concatenates_without_separator() {
        let t = task("op1", "driver", "ui", &[("h1", 4040)]);
        assert_eq!(t.id(), "op1driverui");
        assert_eq!(t.id_with_host_port(), "op1driveruih14040");
    }

    #[test]
    fn id_with_host_port_tracks_job_moves() {
        let a = task("op1", "driver", "ui", &[("h1", 4040)]);
        let b = task("op1", "driver", "ui", &[("h2", 4040)]);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id_with_host_port(), b.id_with_host_port());
    }

    #[test]
    fn fingerprint_is_sha256_suffix() {
        let full = hex::encode(sha2::Sha256::digest(b"op1driverui"));
        assert_eq!(fingerprint(b"op1driverui"), full[full.len() - 8..]);
        assert_eq!(fingerprint(b"op1driverui").len(), 8);
        // Stable across calls.
        assert_eq!(fingerprint(b"op1driverui"), fingerprint(b"op1driverui"));
    }

    #[test]
    fn task_list_sorts_by_id() {
        let mut tasks: TaskList = [
            task("op2", "master", "ui", &[("h", 1)]),
            task("op1", "driver", "ui", &[("h", 1)]),
            task("op1", "driver", "rest", &[("h", 1)]),
        ]
        .into_iter()
        .collect();
        tasks.sort();
        let ids: Vec<String> = tasks.iter().map(Task::id).collect();
        assert_eq!(ids, vec!["op1driverrest", "op1driverui", "op2masterui"]);
    }

    #[test]
    fn validate_skips_tasks_without_alias() {
        let mut t = task("123-456", "Task", "$ervice", &[]);
        t.operation_alias = None;
        assert!(t.validate().is_ok());
    }

    #[test]
    fn validate_checks_aliased_tasks() {
        let mut ok = task("123", "task", "service", &[]);
        ok.operation_alias = Some("alias".to_string());
        assert!(ok.validate().is_ok());

        let mut bad_alias = ok.clone();
        bad_alias.operation_alias = Some("ali-as".to_string());
        assert_eq!(
            bad_alias.validate().unwrap_err(),
            InvalidField {
                field: "operation_alias",
                value: "ali-as".to_string()
            }
        );

        let mut bad_task = ok.clone();
        bad_task.task_name = "Task".to_string();
        assert_eq!(bad_task.validate().unwrap_err().field, "task_name");

        let mut bad_service = ok;
        bad_service.service = "$ervice".to_string();
        assert_eq!(bad_service.validate().unwrap_err().field, "service");
    }

    #[test]
    fn domains() {
        assert_eq!(hash_domain("deadbeef", "proxy.example"), "deadbeef.proxy.example");

        let mut t = task("op1", "driver", "ui", &[]);
        assert_eq!(alias_domain(&t, "proxy.example"), None);
        t.operation_alias = Some("myspark".to_string());
        assert_eq!(
            alias_domain(&t, "proxy.example").unwrap(),
            "myspark-driver-ui.proxy.example"
        );
    }

    #[test]
    fn protocol_round_trips() {
        for p in [Protocol::Http, Protocol::Grpc] {
            assert_eq!(p.as_str().parse::<Protocol>().unwrap(), p);
        }
        assert!("tcp".parse::<Protocol>().is_err());
    }
}
