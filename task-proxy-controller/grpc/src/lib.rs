//! The control-plane gRPC surface: translates the discovered task registry
//! into Envoy configuration snapshots, streams them to connected proxies
//! over the state-of-the-world xDS v3 protocol, and answers the proxy's
//! per-request `ext_authz` checks.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod cache;
pub mod discovery;
pub mod snapshot;

pub use self::{
    auth::AuthServer,
    cache::{Snapshot, SnapshotCache},
    discovery::DiscoveryServer,
};

/// Node id under which every proxy subscribes. All deployed proxies share
/// one configuration, so the cache is effectively single-keyed.
pub const NODE_ID: &str = "id";

/// Data-plane listener port programmed into the snapshot.
pub const PROXY_PORT: u32 = 8080;

/// Control-plane port serving discovery and authorization.
pub const SERVER_PORT: u16 = 9090;
