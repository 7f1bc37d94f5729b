//! Translates a task registry into the Envoy configuration served to the
//! edge proxy: one cluster per job replica, one virtual host per task, and
//! a single listener whose connection manager routes by task domain or by
//! the `x-yt-taskproxy-id` header.

use crate::cache::Snapshot;
use envoy_types::pb::envoy::{
    config::{
        accesslog::v3::{access_log, AccessLog},
        cluster::v3::{cluster, Cluster},
        core::v3::{
            address, data_source, grpc_service, socket_address, transport_socket, Address,
            ApiVersion, DataSource, GrpcService, Http2ProtocolOptions, SocketAddress,
            TransportSocket,
        },
        endpoint::v3::{lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints},
        listener::v3::{filter, Filter, FilterChain, Listener},
        route::v3::{
            header_matcher, route, route_action, route_match, weighted_cluster,
            DirectResponseAction, HeaderMatcher, Route, RouteAction, RouteConfiguration,
            RouteMatch, VirtualHost, WeightedCluster,
        },
    },
    extensions::{
        access_loggers::stream::v3::StderrAccessLog,
        filters::{
            http::{
                ext_authz::v3::{ext_authz, ExtAuthz},
                router::v3::Router,
            },
            network::http_connection_manager::v3::{
                http_connection_manager, http_filter, HttpConnectionManager, HttpFilter,
            },
        },
        transport_sockets::tls::v3::{CommonTlsContext, DownstreamTlsContext, TlsCertificate},
        upstreams::http::v3::{http_protocol_options, HttpProtocolOptions},
    },
    r#type::matcher::v3::{string_matcher, StringMatcher},
};
use envoy_types::pb::google::protobuf::{Any, Duration, UInt32Value};
use prost::Message;
use std::collections::HashSet;
use task_proxy_controller_core::{hash_domain, Protocol, Registry};

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

pub const TLS_CRT_PATH: &str = "/etc/certs/tls.crt";
pub const TLS_KEY_PATH: &str = "/etc/certs/tls.key";

const EXT_AUTHZ_CLUSTER: &str = "extAuthz";
const ROUTER_HEADER: &str = "x-yt-taskproxy-id";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("route references undefined cluster {0:?}")]
    UndefinedCluster(String),
}

/// Builds the snapshot for one registry, stamped with the registry version.
///
/// `tls` selects a TLS filter chain referencing [`TLS_CRT_PATH`] and
/// [`TLS_KEY_PATH`]; `auth_enabled` inserts an `ext_authz` filter delegating
/// to this process ahead of the router.
pub fn make_snapshot(
    registry: &Registry,
    base_domain: &str,
    tls: bool,
    auth_enabled: bool,
) -> Result<Snapshot, SnapshotError> {
    let mut clusters = Vec::new();
    let mut vhosts = Vec::new();
    let mut default_vhost_routes = Vec::new();

    for (fingerprint, task) in registry.iter() {
        let grpc = task.protocol == Protocol::Grpc;
        let vhost_name = format!("{}-{}-{}", task.operation_id, task.task_name, task.service);

        let mut weights = Vec::new();
        for (i, job) in task.jobs.iter().enumerate() {
            let cluster_name = format!("{vhost_name}-{i}");
            clusters.push(make_cluster(&cluster_name, &job.host, job.port, grpc, true));
            weights.push(weighted_cluster::ClusterWeight {
                name: cluster_name,
                weight: Some(UInt32Value { value: 1 }),
                ..Default::default()
            });
        }
        let action = route::Action::Route(RouteAction {
            cluster_specifier: Some(route_action::ClusterSpecifier::WeightedClusters(
                WeightedCluster {
                    clusters: weights,
                    ..Default::default()
                },
            )),
            ..Default::default()
        });

        // Route either by domain...
        vhosts.push(VirtualHost {
            name: vhost_name,
            domains: vec![hash_domain(fingerprint, base_domain)],
            routes: vec![Route {
                r#match: Some(prefix_match("/", Vec::new())),
                action: Some(action.clone()),
                ..Default::default()
            }],
            ..Default::default()
        });
        // ...or by the task-proxy header, for clients that cannot set Host.
        default_vhost_routes.push(Route {
            r#match: Some(prefix_match(
                "/",
                vec![HeaderMatcher {
                    name: ROUTER_HEADER.to_string(),
                    header_match_specifier: Some(header_matcher::HeaderMatchSpecifier::StringMatch(
                        StringMatcher {
                            match_pattern: Some(string_matcher::MatchPattern::Exact(
                                fingerprint.to_string(),
                            )),
                            ..Default::default()
                        },
                    )),
                    ..Default::default()
                }],
            )),
            action: Some(action),
            ..Default::default()
        });
    }

    default_vhost_routes.push(Route {
        r#match: Some(prefix_match("/", Vec::new())),
        action: Some(route::Action::DirectResponse(DirectResponseAction {
            status: 404,
            body: Some(DataSource {
                specifier: Some(data_source::Specifier::InlineString(
                    "no such task".to_string(),
                )),
                ..Default::default()
            }),
        })),
        ..Default::default()
    });
    vhosts.push(VirtualHost {
        name: "vhost_default".to_string(),
        domains: vec!["*".to_string()],
        routes: default_vhost_routes,
        ..Default::default()
    });

    if auth_enabled {
        clusters.push(make_cluster(
            EXT_AUTHZ_CLUSTER,
            "127.0.0.1",
            u32::from(crate::SERVER_PORT),
            true,
            false,
        ));
    }

    let routes = RouteConfiguration {
        name: "local_routes".to_string(),
        virtual_hosts: vhosts,
        ..Default::default()
    };
    check_consistency(&clusters, &routes)?;

    let listener = make_listener(routes, tls, auth_enabled);

    let clusters = clusters
        .iter()
        .map(|c| to_any(CLUSTER_TYPE_URL, c))
        .collect();
    let listeners = vec![to_any(LISTENER_TYPE_URL, &listener)];
    Ok(Snapshot::new(registry.version(), clusters, listeners))
}

/// Every cluster referenced from a route must be defined in the same
/// snapshot, or the proxy would reject the whole configuration.
fn check_consistency(
    clusters: &[Cluster],
    routes: &RouteConfiguration,
) -> Result<(), SnapshotError> {
    let defined: HashSet<&str> = clusters.iter().map(|c| c.name.as_str()).collect();
    for vhost in &routes.virtual_hosts {
        for route in &vhost.routes {
            let Some(route::Action::Route(action)) = &route.action else {
                continue;
            };
            match &action.cluster_specifier {
                Some(route_action::ClusterSpecifier::Cluster(name)) => {
                    if !defined.contains(name.as_str()) {
                        return Err(SnapshotError::UndefinedCluster(name.clone()));
                    }
                }
                Some(route_action::ClusterSpecifier::WeightedClusters(weighted)) => {
                    for weight in &weighted.clusters {
                        if !defined.contains(weight.name.as_str()) {
                            return Err(SnapshotError::UndefinedCluster(weight.name.clone()));
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn make_listener(routes: RouteConfiguration, tls: bool, auth_enabled: bool) -> Listener {
    let mut http_filters = Vec::new();
    if auth_enabled {
        // Per-request authorization callback into this process; transport
        // failures must not fail open.
        let authz = ExtAuthz {
            transport_api_version: ApiVersion::V3 as i32,
            failure_mode_allow: false,
            include_peer_certificate: false,
            services: Some(ext_authz::Services::GrpcService(GrpcService {
                timeout: Some(Duration {
                    seconds: 0,
                    nanos: 800_000_000,
                }),
                target_specifier: Some(grpc_service::TargetSpecifier::EnvoyGrpc(
                    grpc_service::EnvoyGrpc {
                        cluster_name: EXT_AUTHZ_CLUSTER.to_string(),
                        ..Default::default()
                    },
                )),
                ..Default::default()
            })),
            ..Default::default()
        };
        http_filters.push(HttpFilter {
            name: "envoy.filters.http.ext_authz".to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(to_any(
                "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz",
                &authz,
            ))),
            ..Default::default()
        });
    }
    http_filters.push(HttpFilter {
        name: "envoy.filters.http.router".to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(to_any(
            "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router",
            &Router::default(),
        ))),
        ..Default::default()
    });

    let hcm = HttpConnectionManager {
        stat_prefix: "ingress_http".to_string(),
        codec_type: http_connection_manager::CodecType::Auto as i32,
        route_specifier: Some(http_connection_manager::RouteSpecifier::RouteConfig(routes)),
        http_filters,
        http2_protocol_options: Some(Http2ProtocolOptions::default()),
        ..Default::default()
    };

    let transport_socket = tls.then(|| TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(to_any(
            "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext",
            &DownstreamTlsContext {
                common_tls_context: Some(CommonTlsContext {
                    tls_certificates: vec![TlsCertificate {
                        certificate_chain: Some(file_data_source(TLS_CRT_PATH)),
                        private_key: Some(file_data_source(TLS_KEY_PATH)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))),
    });

    Listener {
        name: "listener_0".to_string(),
        address: Some(socket_address("0.0.0.0", crate::PROXY_PORT)),
        filter_chains: vec![FilterChain {
            filters: vec![Filter {
                name: "envoy.filters.network.http_connection_manager".to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(to_any(
                    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager",
                    &hcm,
                ))),
            }],
            transport_socket,
            ..Default::default()
        }],
        access_log: vec![AccessLog {
            name: "envoy.access_loggers.stderr".to_string(),
            config_type: Some(access_log::ConfigType::TypedConfig(to_any(
                "type.googleapis.com/envoy.extensions.access_loggers.stream.v3.StderrAccessLog",
                &StderrAccessLog::default(),
            ))),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn make_cluster(name: &str, host: &str, port: u32, http2: bool, resolve_domain: bool) -> Cluster {
    let discovery_type = if resolve_domain {
        cluster::DiscoveryType::StrictDns
    } else {
        cluster::DiscoveryType::Static
    };

    let mut out = Cluster {
        name: name.to_string(),
        connect_timeout: Some(Duration {
            seconds: 2,
            nanos: 0,
        }),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(discovery_type as i32)),
        lb_policy: cluster::LbPolicy::RoundRobin as i32,
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: name.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                        address: Some(socket_address(host, port)),
                        ..Default::default()
                    })),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    };
    if http2 {
        let options = HttpProtocolOptions {
            upstream_protocol_options: Some(
                http_protocol_options::UpstreamProtocolOptions::ExplicitHttpConfig(
                    http_protocol_options::ExplicitHttpConfig {
                        protocol_config: Some(
                            http_protocol_options::explicit_http_config::ProtocolConfig::Http2ProtocolOptions(
                                Http2ProtocolOptions::default(),
                            ),
                        ),
                    },
                ),
            ),
            ..Default::default()
        };
        out.typed_extension_protocol_options.insert(
            "envoy.extensions.upstreams.http.v3.HttpProtocolOptions".to_string(),
            to_any(
                "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions",
                &options,
            ),
        );
    }
    out
}

fn prefix_match(prefix: &str, headers: Vec<HeaderMatcher>) -> RouteMatch {
    RouteMatch {
        path_specifier: Some(route_match::PathSpecifier::Prefix(prefix.to_string())),
        headers,
        ..Default::default()
    }
}

fn socket_address(host: &str, port: u32) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            protocol: socket_address::Protocol::Tcp as i32,
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

fn file_data_source(path: &str) -> DataSource {
    DataSource {
        specifier: Some(data_source::Specifier::Filename(path.to_string())),
        ..Default::default()
    }
}

fn to_any<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}
