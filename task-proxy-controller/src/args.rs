use crate::publish::Publisher;
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use std::{net::SocketAddr, sync::Arc};
use task_proxy_controller_core::SharedRegistry;
use task_proxy_controller_grpc::{AuthServer, DiscoveryServer, SnapshotCache, SERVER_PORT};
use task_proxy_controller_yt_api::{Client, HttpClient};
use task_proxy_controller_yt_discover::{TaskDiscovery, TaskTable};
use tokio::time::Duration;
use tonic::transport::Server;
use tracing::{error, info, info_span, instrument, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(
    name = "task-proxy-controller",
    about = "Programs the edge proxy with routes to cluster task endpoints"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "task_proxy=info,warn",
        env = "TASK_PROXY_CONTROLLER_LOG"
    )]
    log_level: String,

    /// Namespace of the cluster's HTTP proxies.
    #[clap(long)]
    namespace: String,

    /// Path of a file holding the cluster access token.
    #[clap(long)]
    yt_token_path: String,

    /// Suffix of every task's public domain.
    #[clap(long)]
    base_domain: String,

    /// Path of the reporting table.
    #[clap(long)]
    table_path: String,

    /// Tasks list refresh period, in seconds.
    #[clap(long, default_value = "60")]
    refresh_period_seconds: u64,

    /// Per-request operation authorization.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    auth_enabled: bool,

    /// Name of the cookie carrying the caller's session.
    #[clap(long, default_value = "yc_session")]
    auth_cookie_name: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            namespace,
            yt_token_path,
            base_domain,
            table_path,
            refresh_period_seconds,
            auth_enabled,
            auth_cookie_name,
        } = self;

        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_new(&log_level).context("invalid log level")?)
            .with_writer(std::io::stderr)
            .init();

        let refresh_period = refresh_period(refresh_period_seconds)?;

        let token = std::fs::read_to_string(&yt_token_path)
            .with_context(|| format!("failed to read the cluster token from {yt_token_path:?}"))?
            .trim()
            .to_string();

        let proxy = format!("http-proxies-lb.{namespace}.svc.cluster.local");
        let client = Arc::new(
            HttpClient::new(&proxy, token).context("failed to create the cluster client")?,
        );

        let registry = SharedRegistry::new();
        let cache = Arc::new(SnapshotCache::new());

        let publisher = Publisher::new(
            TaskDiscovery::new(client.clone()),
            TaskTable::new(client.clone(), table_path, base_domain.clone()),
            registry.clone(),
            cache.clone(),
            base_domain,
            auth_enabled,
        );
        tokio::spawn(publisher.run(refresh_period).instrument(info_span!("discovery")));

        let (drain_tx, drain_rx) = drain::channel();
        tokio::spawn(async move {
            shutdown_signal().await;
            drain_tx.drain().await;
        });

        let addr = SocketAddr::from(([0, 0, 0, 0], SERVER_PORT));
        let auth = AuthServer::new(client, registry, auth_cookie_name);
        grpc(addr, cache, auth, drain_rx).await
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc<C: Client>(
    addr: SocketAddr,
    cache: Arc<SnapshotCache>,
    auth: AuthServer<C>,
    drain: drain::Watch,
) -> Result<()> {
    let discovery = DiscoveryServer::new(cache, drain.clone());

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(discovery.aggregated())
            .add_service(discovery.clusters())
            .add_service(discovery.listeners())
            .add_service(auth.svc())
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "discovery and authorization gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

fn refresh_period(seconds: u64) -> Result<Duration> {
    if !(1..=86_400).contains(&seconds) {
        bail!("--refresh-period-seconds must be positive and not greater than 24 hours");
    }
    Ok(Duration::from_secs(seconds))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(error) => {
            error!(%error, "failed to install the SIGTERM handler");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_period_bounds() {
        assert!(refresh_period(0).is_err());
        assert!(refresh_period(86_401).is_err());
        assert_eq!(refresh_period(1).unwrap(), Duration::from_secs(1));
        assert_eq!(refresh_period(60).unwrap(), Duration::from_secs(60));
        assert_eq!(refresh_period(86_400).unwrap(), Duration::from_secs(86_400));
    }
}
