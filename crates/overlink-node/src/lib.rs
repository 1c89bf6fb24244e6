//! # Overlink Node
//!
//! Node coordinator for the Overlink overlay.
//!
//! This crate provides [`OverlinkNode`], which ties together:
//! - Transport providers (direct TCP, uplink, optionally the in-memory
//!   virtual network), keyed by transport id; uplink channels may go
//!   through a relay
//! - The topology service, fed by channel events and link-state flooding
//! - The service registry and RPC client, routed over neighbour channels
//!
//! ## Example
//!
//! ```rust,ignore
//! use overlink_node::{NodeConfig, OverlinkNode};
//!
//! let node = OverlinkNode::new(NodeConfig::default().with_listen("direct:0.0.0.0:9000"))?;
//! node.start().await?;
//!
//! // Connect to a peer and call its echo service
//! let channel = node.connect(&"direct:10.0.0.7:9000".parse()?).await?;
//! let peer = channel.remote_node_id().default_logical_node_id();
//! let reply = node.echo_proxy(peer).echo("hi").await?;
//!
//! node.shutdown().await;
//! ```

mod config;
mod echo;
mod error;
mod handler;
pub mod message;
pub mod neighbours;

pub use config::{LogicalNodeConfig, NodeConfig};
pub use echo::{ECHO_SERVICE, EchoService, EchoServiceProxy};
pub use error::{NodeError, NodeResult};
pub use message::NodeMessage;
pub use neighbours::{ChannelRouteResolver, NeighbourTable};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use overlink_core::{
    ChannelEventHandler, ChannelHandle, HandshakeInfo, InstanceNodeSessionId, LogicalNodeId,
    NetworkContactPoint, NodeIdentifier, RpcResult, TransportContext, TransportError,
    TransportProvider, VirtualNetwork,
};
use overlink_routing::{NetworkGraph, TopologyService};
use overlink_rpc::{RemoteService, RemoteServiceProxy, RpcClient, ServiceRegistry};
use overlink_transport::DirectTransportProvider;
use overlink_uplink::UplinkTransportProvider;

use handler::NodeEventHandler;

/// One session of an overlay node
pub struct OverlinkNode {
    config: NodeConfig,
    session: InstanceNodeSessionId,
    topology: Arc<TopologyService>,
    neighbours: Arc<NeighbourTable>,
    registry: Arc<ServiceRegistry>,
    rpc: Arc<RpcClient>,
    handler: Arc<NodeEventHandler>,
    /// Keyed by transport id
    providers: HashMap<String, Arc<dyn TransportProvider>>,
    uplink: Arc<UplinkTransportProvider>,
    endpoints: RwLock<Vec<NetworkContactPoint>>,
    /// Periodic eviction of stale advertisements
    maintenance: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl OverlinkNode {
    /// Create a node with the direct and uplink transports
    pub fn new(config: NodeConfig) -> NodeResult<Self> {
        Self::build(config, None)
    }

    /// Create a node that also joins an in-memory virtual network
    pub fn with_virtual_network(config: NodeConfig, network: &Arc<VirtualNetwork>) -> NodeResult<Self> {
        Self::build(config, Some(network))
    }

    fn build(config: NodeConfig, network: Option<&Arc<VirtualNetwork>>) -> NodeResult<Self> {
        let session = config.instance_node_id()?.new_session();
        let topology = Arc::new(TopologyService::new(
            session.clone(),
            config.display_name.clone(),
            config.topology.clone(),
        ));
        let neighbours = Arc::new(NeighbourTable::new());
        let registry = Arc::new(ServiceRegistry::new());
        let router = ChannelRouteResolver::new(Arc::clone(&topology), Arc::clone(&neighbours));
        let rpc = Arc::new(RpcClient::new(
            session.clone(),
            config.rpc.clone(),
            Arc::clone(&registry),
            Arc::new(router),
        ));
        let handler = Arc::new(NodeEventHandler::new(
            Arc::clone(&topology),
            Arc::clone(&neighbours),
            Arc::clone(&rpc),
        ));

        let dyn_handler: Arc<dyn ChannelEventHandler> = handler.clone();
        let context = TransportContext::new(
            HandshakeInfo::new(session.clone(), config.display_name.clone()),
            dyn_handler,
        );
        let uplink = Arc::new(UplinkTransportProvider::new(context.clone(), config.uplink.clone()));
        let mut providers: Vec<Arc<dyn TransportProvider>> = vec![
            Arc::new(DirectTransportProvider::new(context.clone(), config.direct.clone())),
            uplink.clone(),
        ];
        if let Some(network) = network {
            providers.push(Arc::new(network.provider(context)));
        }
        let providers = providers
            .into_iter()
            .map(|p| (p.transport_id().to_string(), p))
            .collect();

        if config.echo_service {
            registry.register(Arc::new(EchoService))?;
        }

        info!(
            node = %session.short_id(),
            session = %session,
            name = %config.display_name,
            "Node created"
        );
        Ok(Self {
            config,
            session,
            topology,
            neighbours,
            registry,
            rpc,
            handler,
            providers,
            uplink,
            endpoints: RwLock::new(Vec::new()),
            maintenance: Mutex::new(None),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start the node
    ///
    /// Announces the configured logical nodes, opens the listen endpoints
    /// and connects to the configured peers. A peer that cannot be reached
    /// is logged and skipped. Returns the bound endpoints.
    #[instrument(skip(self), fields(node = %self.session.short_id()))]
    pub async fn start(&self) -> NodeResult<Vec<NetworkContactPoint>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(NodeError::ShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }

        for logical in &self.config.logical_nodes {
            self.add_logical_node(
                &logical.logical_part,
                logical.display_name.clone(),
                logical.capabilities.iter().cloned(),
            )?;
        }

        let mut bound = Vec::new();
        for contact_point in self.config.listen_points()? {
            let provider = self.provider(contact_point.transport_id())?;
            bound.push(provider.create_channel_endpoint(&contact_point).await?);
        }
        self.endpoints.write().extend(bound.iter().cloned());

        for relay in self.config.relay_points()? {
            if let Err(e) = self.attach_relay(&relay).await {
                warn!(relay = %relay, error = %e, "Failed to attach to configured relay");
            }
        }
        for contact_point in self.config.connect_points()? {
            if let Err(e) = self.connect(&contact_point).await {
                warn!(peer = %contact_point, error = %e, "Failed to connect to configured peer");
            }
        }

        *self.maintenance.lock() = Some(self.spawn_maintenance());

        info!(endpoints = bound.len(), "Node started");
        Ok(bound)
    }

    /// Open an additional endpoint after start
    pub async fn listen(&self, contact_point: &NetworkContactPoint) -> NodeResult<NetworkContactPoint> {
        self.ensure_running()?;
        let bound = self
            .provider(contact_point.transport_id())?
            .create_channel_endpoint(contact_point)
            .await?;
        self.endpoints.write().push(bound.clone());
        Ok(bound)
    }

    /// Connect to a remote node through the provider of the contact point's
    /// transport
    #[instrument(skip(self), fields(node = %self.session.short_id(), peer = %contact_point))]
    pub async fn connect(&self, contact_point: &NetworkContactPoint) -> NodeResult<ChannelHandle> {
        self.ensure_running()?;
        let provider = self.provider(contact_point.transport_id())?;
        let channel = provider.connect(contact_point).await?;
        debug!(
            channel = %channel.channel_id(),
            remote = %channel.remote_node_id().short_id(),
            "Connected"
        );
        Ok(channel)
    }

    /// Stay attached to an uplink relay so peers can open channels to this
    /// node's namespace through it
    pub async fn attach_relay(&self, relay: &NetworkContactPoint) -> NodeResult<()> {
        self.ensure_running()?;
        Ok(self.uplink.attach_relay(relay).await?)
    }

    /// Connect to the node serving `destination` behind an uplink relay
    #[instrument(skip(self), fields(node = %self.session.short_id(), relay = %relay))]
    pub async fn connect_via_relay(
        &self,
        relay: &NetworkContactPoint,
        destination: &str,
    ) -> NodeResult<ChannelHandle> {
        self.ensure_running()?;
        let channel = self.uplink.connect_via_relay(relay, destination).await?;
        debug!(
            channel = %channel.channel_id(),
            remote = %channel.remote_node_id().short_id(),
            destination,
            "Connected through relay"
        );
        Ok(channel)
    }

    /// Make a service callable by remote nodes
    pub fn register_service(&self, service: Arc<dyn RemoteService>) -> NodeResult<()> {
        Ok(self.registry.register(service)?)
    }

    pub fn unregister_service(&self, interface_name: &str) -> bool {
        self.registry.unregister(interface_name)
    }

    /// Call `service.method` on `target` with the default timeout
    ///
    /// Fails right away with `NoRoute` if the target is unreachable.
    pub async fn rpc(
        &self,
        target: &LogicalNodeId,
        service: &str,
        method: &str,
        args: Bytes,
    ) -> RpcResult<Bytes> {
        self.rpc.invoke(target, service, method, args).await
    }

    pub async fn rpc_with_timeout(
        &self,
        target: &LogicalNodeId,
        service: &str,
        method: &str,
        args: Bytes,
        timeout: Duration,
    ) -> RpcResult<Bytes> {
        self.rpc
            .invoke_with_timeout(target, service, method, args, timeout)
            .await
    }

    /// Typed proxy for `service` on `target`
    pub fn proxy(&self, target: LogicalNodeId, service: impl Into<String>) -> RemoteServiceProxy {
        self.rpc.proxy(target, service)
    }

    pub fn echo_proxy(&self, target: LogicalNodeId) -> EchoServiceProxy {
        EchoServiceProxy::new(self.proxy(target, ECHO_SERVICE))
    }

    pub fn rpc_client(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub fn topology(&self) -> &Arc<TopologyService> {
        &self.topology
    }

    /// Current topology snapshot
    pub fn graph(&self) -> Arc<NetworkGraph> {
        self.topology.snapshot()
    }

    pub fn reachable_nodes_with_capability(&self, capability: &str) -> BTreeSet<LogicalNodeId> {
        self.topology.reachable_nodes_with_capability(capability)
    }

    /// Announce a logical node of this session to the overlay
    pub fn add_logical_node(
        &self,
        logical_part: &str,
        display_name: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> NodeResult<LogicalNodeId> {
        let (id, lsa) = self
            .topology
            .add_logical_node(logical_part, display_name, capabilities)?;
        self.handler.flood(vec![lsa], None);
        Ok(id)
    }

    pub fn remove_logical_node(&self, logical_part: &str) -> bool {
        match self.topology.remove_logical_node(logical_part) {
            Some(lsa) => {
                self.handler.flood(vec![lsa], None);
                true
            }
            None => false,
        }
    }

    /// Wait until `target` shows up in the topology
    pub async fn wait_until_reachable(&self, target: &InstanceNodeSessionId, timeout: Duration) -> bool {
        let mut snapshots = self.topology.subscribe();
        let wait = async {
            loop {
                if snapshots.borrow_and_update().is_reachable(target) {
                    return true;
                }
                if snapshots.changed().await.is_err() {
                    return false;
                }
            }
        };
        matches!(tokio::time::timeout(timeout, wait).await, Ok(true))
    }

    /// Leave the overlay
    ///
    /// Neighbours get a shutdown advertisement first, then outstanding
    /// calls fail and every provider closes its channels and endpoints.
    #[instrument(skip(self), fields(node = %self.session.short_id()))]
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let lsa = self.topology.shutdown_advertisement();
        match NodeMessage::LinkState(vec![lsa]).encode() {
            Ok(payload) => {
                for channel in self.neighbours.all_except(None) {
                    if let Err(e) = channel.send(payload.clone()).await {
                        debug!(channel = %channel.channel_id(), error = %e, "Shutdown advertisement not sent");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Cannot encode shutdown advertisement"),
        }

        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
        let cancelled = self.rpc.cancel_all();
        for provider in self.providers.values() {
            provider.shutdown().await;
        }
        self.endpoints.write().clear();
        info!(cancelled, "Node shut down");
    }

    pub fn session_id(&self) -> &InstanceNodeSessionId {
        &self.session
    }

    /// The default logical node of this session
    pub fn logical_node_id(&self) -> LogicalNodeId {
        self.session.default_logical_node_id()
    }

    pub fn display_name(&self) -> &str {
        &self.config.display_name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Endpoints currently listening
    pub fn endpoints(&self) -> Vec<NetworkContactPoint> {
        self.endpoints.read().clone()
    }

    /// Sessions with an established channel
    pub fn neighbours(&self) -> BTreeSet<InstanceNodeSessionId> {
        self.neighbours.neighbours()
    }

    /// Registered transport ids, sorted
    pub fn transport_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let topology = Arc::clone(&self.topology);
        let period = topology.config().eviction_interval();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                topology.evict_stale_advertisements();
            }
        })
    }

    fn provider(&self, transport_id: &str) -> NodeResult<&Arc<dyn TransportProvider>> {
        self.providers
            .get(transport_id)
            .ok_or_else(|| TransportError::UnknownTransport(transport_id.to_string()).into())
    }

    fn ensure_running(&self) -> NodeResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(NodeError::ShutDown);
        }
        Ok(())
    }
}

impl std::fmt::Debug for OverlinkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlinkNode")
            .field("session", &self.session)
            .field("name", &self.config.display_name)
            .field("neighbours", &self.neighbours.len())
            .finish()
    }
}
