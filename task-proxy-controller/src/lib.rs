//! Control plane for the cluster task proxy.
//!
//! The server discovers which running compute operations expose user-facing
//! endpoints, assigns each a stable external domain, and programs one or
//! more edge proxies with a fresh routing configuration over the streaming
//! xDS protocol. A companion authorization endpoint decides, per inbound
//! request, whether the caller may reach the operation behind a domain.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use task_proxy_controller_core as core;
pub use task_proxy_controller_grpc as grpc;
pub use task_proxy_controller_yt_api as yt;
pub use task_proxy_controller_yt_discover as discover;

mod args;
mod publish;

pub use self::{args::Args, publish::Publisher};
