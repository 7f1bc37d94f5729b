//! Cluster API surface used by discovery and authorization.
//!
//! The control plane only needs a small capability set from the cluster:
//! operation/job enumeration, a few Cypress node reads, the reporting-table
//! writes, and delegated credential checks. [`Client`] captures exactly that
//! set so tests can substitute a deterministic fake; [`HttpClient`] is the
//! production implementation speaking to the cluster's HTTP proxies.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod guid;
mod http;

pub use self::{
    guid::{InvalidOperationId, OperationId},
    http::{Error as HttpError, HttpClient},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
pub use task_proxy_controller_core::TaskRow;

/// Cluster capabilities consumed by the control plane.
#[async_trait::async_trait]
pub trait Client: Send + Sync + 'static {
    /// One page of running operations, newest first, starting strictly
    /// before `cursor` when one is given. Each operation carries its id,
    /// runtime parameters (with annotations) and brief spec.
    async fn list_operations(
        &self,
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<OperationStatus>>;

    /// Running jobs of one operation.
    async fn list_jobs(&self, operation_id: &str) -> Result<Vec<JobInfo>>;

    async fn get_node(&self, path: &str) -> Result<Value>;

    /// Names of a map node's children.
    async fn list_node(&self, path: &str) -> Result<Vec<String>>;

    async fn node_exists(&self, path: &str) -> Result<bool>;

    async fn create_table(&self, path: &str) -> Result<()>;

    /// Truncates the table and writes `rows`.
    async fn write_table(&self, path: &str, rows: &[TaskRow]) -> Result<()>;

    /// Resolves the identity behind `credentials`.
    async fn who_am_i(&self, credentials: &Credentials) -> Result<WhoAmI>;

    async fn check_operation_permission(
        &self,
        operation_id: &OperationId,
        user: &str,
        permission: Permission,
    ) -> Result<PermissionCheck>;
}

/// One running operation as returned by `list_operations`.
#[derive(Clone, Debug, Deserialize)]
pub struct OperationStatus {
    pub id: String,
    pub start_time: DateTime<Utc>,
    /// Loosely typed user-supplied spec summary; `title` lives here.
    #[serde(default)]
    pub brief_spec: Value,
    #[serde(default)]
    pub runtime_parameters: RuntimeParameters,
}

impl OperationStatus {
    pub fn annotations(&self) -> &Value {
        &self.runtime_parameters.annotations
    }

    /// The operation title, or `""` when unset or not a string.
    pub fn title(&self) -> &str {
        self.brief_spec
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RuntimeParameters {
    /// User-supplied annotation tree; every consumer extracts fields
    /// totally, dropping missing or mistyped values.
    #[serde(default)]
    pub annotations: Value,
}

/// One running job replica of an operation.
#[derive(Clone, Debug, Deserialize)]
pub struct JobInfo {
    pub id: String,
    /// Exec node address, `host:port`.
    pub address: String,
    #[serde(default)]
    pub task_name: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct WhoAmI {
    pub login: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Permission {
    Read,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
        }
    }
}

/// Verdict of a permission check. Anything but the literal `allow` denies.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PermissionCheck {
    pub action: String,
}

impl PermissionCheck {
    pub fn allow() -> Self {
        Self {
            action: "allow".to_string(),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.action == "allow"
    }
}

/// Caller identity material extracted from an inbound request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    OAuth(String),
    Bearer(String),
    Cookie { name: String, value: String },
}

// Tokens and session cookies must not reach logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::OAuth(_) => f.write_str("Credentials::OAuth(..)"),
            Credentials::Bearer(_) => f.write_str("Credentials::Bearer(..)"),
            Credentials::Cookie { name, .. } => {
                f.debug_struct("Credentials::Cookie").field("name", name).finish_non_exhaustive()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_status_deserializes() {
        let op: OperationStatus = serde_json::from_value(serde_json::json!({
            "id": "1a2b3c4d-5e6f7890-12345678-9abcdef0",
            "start_time": "2024-05-01T12:00:00.000000Z",
            "brief_spec": {"title": "Spark driver for my-app"},
            "runtime_parameters": {
                "annotations": {"is_spark": true}
            }
        }))
        .unwrap();
        assert_eq!(op.title(), "Spark driver for my-app");
        assert_eq!(op.annotations().get("is_spark"), Some(&Value::Bool(true)));
    }

    #[test]
    fn operation_status_tolerates_missing_attributes() {
        let op: OperationStatus = serde_json::from_value(serde_json::json!({
            "id": "1-2-3-4",
            "start_time": "2024-05-01T12:00:00Z"
        }))
        .unwrap();
        assert_eq!(op.title(), "");
        assert!(op.annotations().is_null());
    }

    #[test]
    fn credentials_debug_redacts() {
        let rendered = format!(
            "{:?}",
            Credentials::Cookie {
                name: "yc_session".to_string(),
                value: "secret".to_string()
            }
        );
        assert!(!rendered.contains("secret"));
        assert!(!format!("{:?}", Credentials::OAuth("secret".to_string())).contains("secret"));
    }
}
