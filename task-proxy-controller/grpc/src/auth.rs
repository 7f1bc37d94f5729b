//! Per-request authorization: the edge proxy calls `Check` for every
//! inbound request, and the decision is made against the same registry the
//! snapshot was built from, with credential checking delegated to the
//! cluster.

use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
use envoy_types::pb::envoy::service::auth::v3::{
    authorization_server::{Authorization, AuthorizationServer},
    check_response, CheckRequest, CheckResponse, DeniedHttpResponse, OkHttpResponse,
};
use envoy_types::pb::google::rpc::Status as RpcStatus;
use std::{collections::HashMap, sync::Arc};
use task_proxy_controller_core::SharedRegistry;
use task_proxy_controller_yt_api::{Client, Credentials, OperationId, Permission};
use tonic::{Request, Response, Status};
use tracing::{debug, error, warn};

/// Answers the proxy's `ext_authz` checks.
///
/// `Check` never fails at the gRPC level: transport problems, unknown
/// hosts, and missing credentials all deny the one request and the server
/// carries on. The proxy is configured with `failure_mode_allow = false`,
/// so a gRPC failure would deny anyway, just less legibly.
#[derive(Clone, Debug)]
pub struct AuthServer<C> {
    client: Arc<C>,
    registry: SharedRegistry,
    cookie_name: String,
}

impl<C: Client> AuthServer<C> {
    pub fn new(client: Arc<C>, registry: SharedRegistry, cookie_name: String) -> Self {
        Self {
            client,
            registry,
            cookie_name,
        }
    }

    pub fn svc(self) -> AuthorizationServer<Self> {
        AuthorizationServer::new(self)
    }

    async fn check_permission(
        &self,
        operation_id: &str,
        headers: &HashMap<String, String>,
    ) -> anyhow::Result<bool> {
        let Some(credentials) = self.credentials_from_headers(headers) else {
            return Ok(false);
        };

        let user = self.client.who_am_i(&credentials).await?.login;
        if user.is_empty() {
            warn!("user not identified by the provided credentials");
            return Ok(false);
        }
        debug!(%user, "resolved caller identity");

        let operation_id: OperationId = match operation_id.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(operation_id, "task has an invalid operation id");
                return Ok(false);
            }
        };

        let verdict = self
            .client
            .check_operation_permission(&operation_id, &user, Permission::Read)
            .await?;
        debug!(
            action = %verdict.action,
            %user,
            operation_id = %operation_id,
            "operation permission checked",
        );
        Ok(verdict.is_allow())
    }

    fn credentials_from_headers(&self, headers: &HashMap<String, String>) -> Option<Credentials> {
        if let Some(authorization) = headers.get("authorization") {
            let parts: Vec<&str> = authorization.split(' ').collect();
            let [scheme, token] = parts[..] else {
                warn!("invalid authorization header value");
                return None;
            };
            return match scheme.to_ascii_lowercase().as_str() {
                "oauth" => {
                    debug!("caller authorization is an OAuth token");
                    Some(Credentials::OAuth(token.to_string()))
                }
                "bearer" => {
                    debug!("caller authorization is a Bearer token");
                    Some(Credentials::Bearer(token.to_string()))
                }
                scheme => {
                    warn!(scheme, "unknown authorization scheme");
                    None
                }
            };
        }

        if let Some(cookies) = headers.get("cookie") {
            for cookie in cookies.split(';') {
                if let Some((name, value)) = cookie.trim().split_once('=') {
                    if name == self.cookie_name {
                        debug!(cookie = %self.cookie_name, "caller authorization is a cookie");
                        return Some(Credentials::Cookie {
                            name: name.to_string(),
                            value: value.to_string(),
                        });
                    }
                }
            }
        }

        warn!(
            cookie = %self.cookie_name,
            "no supported authorization method in headers",
        );
        None
    }
}

#[tonic::async_trait]
impl<C: Client> Authorization for AuthServer<C> {
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let http = request
            .into_inner()
            .attributes
            .and_then(|attributes| attributes.request)
            .and_then(|request| request.http)
            .unwrap_or_default();

        if http.host.is_empty() {
            warn!("authority (host) header is missing in request");
            return Ok(Response::new(denied_response()));
        }
        debug!(host = %http.host, path = %http.path, "checking authorization");

        let fingerprint = http.host.split('.').next().unwrap_or_default();
        let registry = self.registry.load();
        let Some(task) = registry.get(fingerprint) else {
            warn!(host = %http.host, "no entry in the task registry");
            return Ok(Response::new(denied_response()));
        };

        // UI statics are public; the Spark UI serves them unauthenticated.
        if task.service == "ui" && http.path.starts_with("/static") {
            debug!(path = %http.path, "skipping authorization for ui statics");
            return Ok(Response::new(ok_response()));
        }

        let allowed = match self.check_permission(&task.operation_id, &http.headers).await {
            Ok(allowed) => allowed,
            Err(error) => {
                error!("error while checking operation permission: {error:#}");
                false
            }
        };
        if allowed {
            Ok(Response::new(ok_response()))
        } else {
            Ok(Response::new(denied_response()))
        }
    }
}

fn ok_response() -> CheckResponse {
    CheckResponse {
        status: Some(RpcStatus {
            code: tonic::Code::Ok as i32,
            ..Default::default()
        }),
        http_response: Some(check_response::HttpResponse::OkResponse(
            OkHttpResponse::default(),
        )),
        ..Default::default()
    }
}

fn denied_response() -> CheckResponse {
    CheckResponse {
        status: Some(RpcStatus {
            code: tonic::Code::PermissionDenied as i32,
            message: "permission denied".to_string(),
            ..Default::default()
        }),
        http_response: Some(check_response::HttpResponse::DeniedResponse(
            DeniedHttpResponse {
                status: Some(HttpStatus {
                    code: StatusCode::Forbidden as i32,
                }),
                body: "permission denied".to_string(),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}
