use crate::{
    Credentials, JobInfo, OperationId, OperationStatus, Permission, PermissionCheck, WhoAmI,
};
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use task_proxy_controller_core::TaskRow;
use tracing::debug;
use url::Url;

/// Floor for every cluster round-trip; the process-level context still
/// applies on top.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const OPERATION_ATTRIBUTES: &str = r#"["id";"start_time";"runtime_parameters";"brief_spec"]"#;

/// Production [`Client`](crate::Client) speaking to the cluster's HTTP
/// proxies. Service requests authenticate with the process token; identity
/// resolution substitutes the caller's credentials per request.
#[derive(Clone, Debug)]
pub struct HttpClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl HttpClient {
    pub fn new(proxy: &str, token: String) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let base = Url::parse(&format!("http://{proxy}/"))?;
        Ok(Self { http, base, token })
    }

    fn command(&self, name: &str) -> Result<Url, Error> {
        Ok(self.base.join("api/v4/")?.join(name)?)
    }

    fn authenticated(&self, req: RequestBuilder) -> RequestBuilder {
        req.header(header::AUTHORIZATION, format!("OAuth {}", self.token))
    }

    fn with_credentials(req: RequestBuilder, credentials: &Credentials) -> RequestBuilder {
        match credentials {
            Credentials::OAuth(token) => {
                req.header(header::AUTHORIZATION, format!("OAuth {token}"))
            }
            Credentials::Bearer(token) => {
                req.header(header::AUTHORIZATION, format!("Bearer {token}"))
            }
            Credentials::Cookie { name, value } => {
                req.header(header::COOKIE, format!("{name}={value}"))
            }
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, Error> {
        let rsp = req.send().await?;
        let status = rsp.status();
        if !status.is_success() {
            let message = rsp.text().await.unwrap_or_default();
            return Err(Error::Api { status, message });
        }
        Ok(rsp.json().await?)
    }
}

#[async_trait::async_trait]
impl crate::Client for HttpClient {
    async fn list_operations(
        &self,
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<OperationStatus>> {
        let mut query = vec![
            ("state".to_string(), "running".to_string()),
            ("cursor_direction".to_string(), "past".to_string()),
            ("limit".to_string(), limit.to_string()),
            ("attributes".to_string(), OPERATION_ATTRIBUTES.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push((
                "cursor_time".to_string(),
                cursor.to_rfc3339_opts(SecondsFormat::Micros, true),
            ));
        }

        #[derive(serde::Deserialize)]
        struct Rsp {
            operations: Vec<OperationStatus>,
        }

        let url = self.command("list_operations")?;
        let rsp: Rsp = self
            .fetch(self.authenticated(self.http.get(url).query(&query)))
            .await?;
        Ok(rsp.operations)
    }

    async fn list_jobs(&self, operation_id: &str) -> Result<Vec<JobInfo>> {
        #[derive(serde::Deserialize)]
        struct Rsp {
            jobs: Vec<JobInfo>,
        }

        let url = self.command("list_jobs")?;
        let rsp: Rsp = self
            .fetch(self.authenticated(self.http.get(url).query(&[
                ("operation_id", operation_id),
                ("job_state", "running"),
            ])))
            .await?;
        Ok(rsp.jobs)
    }

    async fn get_node(&self, path: &str) -> Result<Value> {
        let url = self.command("get")?;
        let rsp: ValueRsp<Value> = self
            .fetch(self.authenticated(self.http.get(url).query(&[("path", path)])))
            .await?;
        Ok(rsp.value)
    }

    async fn list_node(&self, path: &str) -> Result<Vec<String>> {
        let url = self.command("list")?;
        let rsp: ValueRsp<Vec<String>> = self
            .fetch(self.authenticated(self.http.get(url).query(&[("path", path)])))
            .await?;
        Ok(rsp.value)
    }

    async fn node_exists(&self, path: &str) -> Result<bool> {
        let url = self.command("exists")?;
        let rsp: ValueRsp<bool> = self
            .fetch(self.authenticated(self.http.get(url).query(&[("path", path)])))
            .await?;
        Ok(rsp.value)
    }

    async fn create_table(&self, path: &str) -> Result<()> {
        let url = self.command("create")?;
        let rsp = self
            .authenticated(
                self.http
                    .post(url)
                    .query(&[("path", path), ("type", "table")]),
            )
            .send()
            .await
            .map_err(Error::from)?;
        let status = rsp.status();
        if !status.is_success() {
            let message = rsp.text().await.unwrap_or_default();
            return Err(Error::Api { status, message }.into());
        }
        Ok(())
    }

    async fn write_table(&self, path: &str, rows: &[TaskRow]) -> Result<()> {
        let mut body = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut body, row)?;
            body.push(b'\n');
        }

        debug!(path, rows = rows.len(), "writing reporting table");
        let url = self.command("write_table")?;
        let rsp = self
            .authenticated(
                self.http
                    .put(url)
                    .query(&[("path", path), ("input_format", "json")])
                    .body(body),
            )
            .send()
            .await
            .map_err(Error::from)?;
        let status = rsp.status();
        if !status.is_success() {
            let message = rsp.text().await.unwrap_or_default();
            return Err(Error::Api { status, message }.into());
        }
        Ok(())
    }

    async fn who_am_i(&self, credentials: &Credentials) -> Result<WhoAmI> {
        let url = self.base.join("auth/whoami")?;
        let rsp = self
            .fetch(Self::with_credentials(self.http.get(url), credentials))
            .await?;
        Ok(rsp)
    }

    async fn check_operation_permission(
        &self,
        operation_id: &OperationId,
        user: &str,
        permission: Permission,
    ) -> Result<PermissionCheck> {
        let url = self.command("check_operation_permission")?;
        let rsp = self
            .fetch(self.authenticated(self.http.get(url).query(&[
                ("operation_id", operation_id.as_str()),
                ("user", user),
                ("permission", permission.as_str()),
            ])))
            .await?;
        Ok(rsp)
    }
}

#[derive(serde::Deserialize)]
struct ValueRsp<T> {
    value: T,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cluster request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid cluster url: {0}")]
    Url(#[from] url::ParseError),

    #[error("cluster responded {status}: {message}")]
    Api { status: StatusCode, message: String },
}
