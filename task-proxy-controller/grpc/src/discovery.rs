//! State-of-the-world xDS v3 serving: aggregated, cluster, and listener
//! discovery over long-lived streams fed from the [`SnapshotCache`].

use crate::{
    cache::{Snapshot, SnapshotCache},
    snapshot::{CLUSTER_TYPE_URL, LISTENER_TYPE_URL},
};
use envoy_types::pb::envoy::service::{
    cluster::v3::cluster_discovery_service_server::{
        ClusterDiscoveryService, ClusterDiscoveryServiceServer,
    },
    discovery::v3::{
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    },
    listener::v3::listener_discovery_service_server::{
        ListenerDiscoveryService, ListenerDiscoveryServiceServer,
    },
};
use futures::prelude::*;
use std::{collections::HashMap, pin::Pin, sync::Arc};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

pub type BoxDiscoveryStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send + 'static>>;
pub type BoxDeltaStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send + 'static>>;

/// Serves the three discovery services the edge proxy may be configured
/// with. Only the state-of-the-world variants are implemented; the proxies
/// this control plane programs do not use delta xDS.
#[derive(Clone, Debug)]
pub struct DiscoveryServer {
    cache: Arc<SnapshotCache>,
    drain: drain::Watch,
}

impl DiscoveryServer {
    pub fn new(cache: Arc<SnapshotCache>, drain: drain::Watch) -> Self {
        Self { cache, drain }
    }

    pub fn aggregated(&self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self.clone())
    }

    pub fn clusters(&self) -> ClusterDiscoveryServiceServer<Self> {
        ClusterDiscoveryServiceServer::new(self.clone())
    }

    pub fn listeners(&self) -> ListenerDiscoveryServiceServer<Self> {
        ListenerDiscoveryServiceServer::new(self.clone())
    }

    fn fetch(
        &self,
        req: &DiscoveryRequest,
        type_url: &str,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        let node_id = req.node.as_ref().map(|n| n.id.clone()).unwrap_or_default();
        let snapshot = self
            .cache
            .current(&node_id)
            .ok_or_else(|| Status::unavailable("no snapshot published"))?;
        Ok(Response::new(DiscoveryResponse {
            version_info: snapshot.version().to_string(),
            resources: snapshot.resources(type_url).to_vec(),
            type_url: type_url.to_string(),
            ..Default::default()
        }))
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = BoxDiscoveryStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(Response::new(sotw_stream(
            self.cache.clone(),
            self.drain.clone(),
            request.into_inner(),
            "",
        )))
    }

    type DeltaAggregatedResourcesStream = BoxDeltaStream;

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }
}

#[tonic::async_trait]
impl ClusterDiscoveryService for DiscoveryServer {
    type StreamClustersStream = BoxDiscoveryStream;

    async fn stream_clusters(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamClustersStream>, Status> {
        Ok(Response::new(sotw_stream(
            self.cache.clone(),
            self.drain.clone(),
            request.into_inner(),
            CLUSTER_TYPE_URL,
        )))
    }

    type DeltaClustersStream = BoxDeltaStream;

    async fn delta_clusters(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaClustersStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }

    async fn fetch_clusters(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(&request.into_inner(), CLUSTER_TYPE_URL)
    }
}

#[tonic::async_trait]
impl ListenerDiscoveryService for DiscoveryServer {
    type StreamListenersStream = BoxDiscoveryStream;

    async fn stream_listeners(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamListenersStream>, Status> {
        Ok(Response::new(sotw_stream(
            self.cache.clone(),
            self.drain.clone(),
            request.into_inner(),
            LISTENER_TYPE_URL,
        )))
    }

    type DeltaListenersStream = BoxDeltaStream;

    async fn delta_listeners(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaListenersStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }

    async fn fetch_listeners(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(&request.into_inner(), LISTENER_TYPE_URL)
    }
}

/// One state-of-the-world stream. The first request names the subscribing
/// node; every subsequent request is either a new type subscription, an
/// ACK/NACK of the last response, or a reconnect. Installed snapshots are
/// pushed to every subscribed type whose last-sent version is stale.
fn sotw_stream<S>(
    cache: Arc<SnapshotCache>,
    drain: drain::Watch,
    mut requests: S,
    default_type_url: &'static str,
) -> BoxDiscoveryStream
where
    S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
{
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        let first = tokio::select! {
            req = requests.next() => req,
            _ = (&mut shutdown) => return,
        };
        let first = match first {
            Some(req) => req?,
            None => return,
        };
        let node_id = first.node.as_ref().map(|n| n.id.clone()).unwrap_or_default();
        debug!(node_id, "proxy subscribed");

        let mut snapshots = cache.subscribe(&node_id);
        let mut state = StreamState::new(default_type_url);

        let current = snapshots.borrow_and_update().clone();
        if let Some(rsp) = state.handle_request(current.as_deref(), &first) {
            yield rsp;
        }

        loop {
            let mut pending_req = None;
            tokio::select! {
                req = requests.next() => {
                    match req {
                        Some(req) => pending_req = Some(req),
                        None => return,
                    }
                }

                res = snapshots.changed() => {
                    if res.is_err() {
                        return;
                    }
                    let Some(snapshot) = snapshots.borrow_and_update().clone() else {
                        continue;
                    };
                    for rsp in state.refresh(&snapshot) {
                        yield rsp;
                    }
                }

                _ = (&mut shutdown) => {
                    return;
                }
            }
            if let Some(req) = pending_req {
                let req = req?;
                // Plain borrow: a concurrent install must still wake the
                // watch arm for the types this request does not cover.
                let current = snapshots.borrow().clone();
                if let Some(rsp) = state.handle_request(current.as_deref(), &req) {
                    yield rsp;
                }
            }
        }
    })
}

/// Per-stream bookkeeping: which type urls the proxy subscribed to and the
/// version last sent for each.
struct StreamState {
    default_type_url: &'static str,
    subscriptions: HashMap<String, String>,
    nonce: u64,
}

impl StreamState {
    fn new(default_type_url: &'static str) -> Self {
        Self {
            default_type_url,
            subscriptions: HashMap::new(),
            nonce: 0,
        }
    }

    fn handle_request(
        &mut self,
        snapshot: Option<&Snapshot>,
        req: &DiscoveryRequest,
    ) -> Option<DiscoveryResponse> {
        let type_url = if req.type_url.is_empty() {
            self.default_type_url
        } else {
            req.type_url.as_str()
        };
        if type_url.is_empty() {
            warn!("discovery request without a type url");
            return None;
        }
        let type_url = type_url.to_string();

        if let Some(error) = &req.error_detail {
            warn!(
                type_url,
                code = error.code,
                message = %error.message,
                "proxy rejected configuration",
            );
            // Keep the subscription; the next install retries.
            self.subscriptions.entry(type_url).or_default();
            return None;
        }

        match self.subscriptions.get(&type_url) {
            // ACK of exactly what this stream last sent.
            Some(sent) if *sent == req.version_info => None,
            _ => {
                let Some(snapshot) = snapshot else {
                    self.subscriptions.insert(type_url, String::new());
                    return None;
                };
                if !snapshot.has(&type_url) {
                    debug!(type_url, "no resources of the requested type");
                    self.subscriptions.insert(type_url, String::new());
                    return None;
                }
                if snapshot.version() == req.version_info {
                    // A reconnecting proxy already holds the current version.
                    self.subscriptions.insert(type_url, req.version_info.clone());
                    None
                } else {
                    Some(self.response(snapshot, &type_url))
                }
            }
        }
    }

    fn refresh(&mut self, snapshot: &Snapshot) -> Vec<DiscoveryResponse> {
        let stale: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(type_url, sent)| {
                snapshot.has(type_url) && sent.as_str() != snapshot.version()
            })
            .map(|(type_url, _)| type_url.clone())
            .collect();
        stale
            .iter()
            .map(|type_url| self.response(snapshot, type_url))
            .collect()
    }

    fn response(&mut self, snapshot: &Snapshot, type_url: &str) -> DiscoveryResponse {
        self.nonce += 1;
        self.subscriptions
            .insert(type_url.to_string(), snapshot.version().to_string());
        debug!(
            type_url,
            version = snapshot.version(),
            nonce = self.nonce,
            "pushing resources",
        );
        DiscoveryResponse {
            version_info: snapshot.version().to_string(),
            resources: snapshot.resources(type_url).to_vec(),
            type_url: type_url.to_string(),
            nonce: self.nonce.to_string(),
            ..Default::default()
        }
    }
}
