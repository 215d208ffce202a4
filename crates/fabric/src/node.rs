//! The per-process root of the fabric.
//!
//! A [`Node`] owns every [`NodeLink`] it has, keyed by the remote node's
//! name. Brokers name the nodes that connect to them and introduce nodes to
//! each other; normal nodes reach unknown peers by asking their broker.
//!
//! All mutable state sits behind one mutex. It is never held while a link
//! transmits or a callback runs: state is copied out, the lock released, and
//! only then are links driven and callbacks invoked. Transports may deliver
//! synchronously, so holding the lock across either would deadlock as soon
//! as a reply re-enters the node.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::{LinkLayout, NodeConfig};
use crate::connector::{ConnectFlags, Connector};
use crate::driver::{Driver, DriverNodeHandle, DriverObject, SharedMemory, Transport};
use crate::error::{Error, Result};
use crate::memory::NodeLinkMemory;
use crate::message::Message;
use crate::node_link::{LinkParams, LinkSide, NodeLink};
use crate::node_name::{IdentityAuthority, NodeName, RandomNameAuthority};
use crate::portal::PortalHandle;

/// Receives the outcome of a link request; `None` means it failed.
pub type LinkCallback = Box<dyn FnOnce(Option<Arc<NodeLink>>) + Send>;

/// Receives newly allocated shared memory, or `None` on failure.
pub type MemoryCallback = Box<dyn FnOnce(Option<Arc<dyn SharedMemory>>) + Send>;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum NodeType {
    /// Names other nodes and introduces them to each other.
    Broker,
    /// Learns its name from a broker.
    Normal,
}

/// Consumer of `Routed` payloads, i.e. the portal/router layer.
pub trait RoutedMessageHandler: Send + Sync + 'static {
    /// An error marks the message as invalid and gets the sender reported.
    fn on_routed_message(
        &self,
        from: NodeName,
        payload: Bytes,
        objects: Vec<DriverObject>,
    ) -> Result<()>;
}

impl<F> RoutedMessageHandler for F
where
    F: Fn(NodeName, Bytes, Vec<DriverObject>) -> Result<()> + Send + Sync + 'static,
{
    fn on_routed_message(
        &self,
        from: NodeName,
        payload: Bytes,
        objects: Vec<DriverObject>,
    ) -> Result<()> {
        self(from, payload, objects)
    }
}

/// Unordered pair of node names.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
struct NamePair(NodeName, NodeName);

impl NamePair {
    fn new(a: NodeName, b: NodeName) -> Self {
        if a <= b {
            NamePair(a, b)
        } else {
            NamePair(b, a)
        }
    }
}

#[derive(Default)]
struct NodeState {
    assigned_name: Option<NodeName>,
    broker_link: Option<Arc<NodeLink>>,
    allocation_delegate_link: Option<Arc<NodeLink>>,
    links: HashMap<NodeName, Arc<NodeLink>>,
    pending_introductions: HashMap<NodeName, Vec<LinkCallback>>,
    in_progress_introductions: HashSet<NamePair>,
    broker_link_callbacks: Vec<LinkCallback>,
    shut_down: bool,
}

impl NodeState {
    fn assign_name(&mut self, node_type: NodeType, name: NodeName) -> Result<()> {
        if node_type == NodeType::Broker {
            return Err(Error::BrokerSelfAssigned);
        }
        if self.assigned_name.is_some() {
            return Err(Error::AlreadyAssigned);
        }
        self.assigned_name = Some(name);
        Ok(())
    }

    fn is_broker_link(&self, link: &Arc<NodeLink>) -> bool {
        self.broker_link
            .as_ref()
            .is_some_and(|broker| Arc::ptr_eq(broker, link))
    }
}

/// Builder for [`Node`].
pub struct NodeBuilder {
    node_type: NodeType,
    driver: Arc<dyn Driver>,
    driver_node: DriverNodeHandle,
    authority: Option<Arc<dyn IdentityAuthority>>,
    config: NodeConfig,
}

impl NodeBuilder {
    pub fn new(node_type: NodeType, driver: Arc<dyn Driver>) -> Self {
        Self {
            node_type,
            driver,
            driver_node: DriverNodeHandle::default(),
            authority: None,
            config: NodeConfig::default(),
        }
    }

    #[must_use]
    pub fn with_driver_node(mut self, handle: DriverNodeHandle) -> Self {
        self.driver_node = handle;
        self
    }

    #[must_use]
    pub fn with_identity_authority(mut self, authority: Arc<dyn IdentityAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Arc<Node>> {
        self.config.memory.validate()?;
        if self.config.protocol_version == 0 {
            return Err(Error::invalid_argument("protocol version 0"));
        }
        Ok(Node::from_builder(self))
    }
}

pub struct Node {
    node_type: NodeType,
    driver: Arc<dyn Driver>,
    driver_node: DriverNodeHandle,
    authority: Arc<dyn IdentityAuthority>,
    config: NodeConfig,
    state: Mutex<NodeState>,
    routed_handler: RwLock<Option<Arc<dyn RoutedMessageHandler>>>,
}

impl Node {
    /// A node with default configuration and random names.
    pub fn new(node_type: NodeType, driver: Arc<dyn Driver>) -> Arc<Node> {
        Node::from_builder(NodeBuilder::new(node_type, driver))
    }

    pub fn builder(node_type: NodeType, driver: Arc<dyn Driver>) -> NodeBuilder {
        NodeBuilder::new(node_type, driver)
    }

    fn from_builder(builder: NodeBuilder) -> Arc<Node> {
        let authority = builder
            .authority
            .unwrap_or_else(|| {
                Arc::new(RandomNameAuthority::new(Arc::clone(&builder.driver)))
                    as Arc<dyn IdentityAuthority>
            });
        let mut state = NodeState::default();
        if builder.node_type == NodeType::Broker {
            state.assigned_name = Some(authority.generate_name());
        }
        Arc::new(Node {
            node_type: builder.node_type,
            driver: builder.driver,
            driver_node: builder.driver_node,
            authority,
            config: builder.config,
            state: Mutex::new(state),
            routed_handler: RwLock::new(None),
        })
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn driver_node(&self) -> DriverNodeHandle {
        self.driver_node
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) fn generate_name(&self) -> NodeName {
        self.authority.generate_name()
    }

    pub fn assigned_name(&self) -> Option<NodeName> {
        self.state.lock().assigned_name
    }

    /// Set this node's name. Only a normal node may be named, and only once.
    pub fn set_assigned_name(&self, name: NodeName) -> Result<()> {
        self.state.lock().assign_name(self.node_type, name)
    }

    /// Run the handshake over `transport` and register the resulting link.
    /// `initial_portals` are bound once the link is up.
    pub fn connect_node(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        flags: ConnectFlags,
        initial_portals: &[PortalHandle],
    ) -> Result<()> {
        let to_broker = flags.contains(ConnectFlags::TO_BROKER);
        if flags.contains(ConnectFlags::TO_ALLOCATION_DELEGATE) && !to_broker {
            return Err(Error::invalid_argument(
                "an allocation delegate must be the broker",
            ));
        }
        match self.node_type {
            NodeType::Broker if to_broker => {
                return Err(Error::invalid_argument("brokers cannot connect to a broker"));
            }
            NodeType::Normal if !to_broker => {
                return Err(Error::invalid_argument(
                    "normal nodes can only connect to a broker",
                ));
            }
            _ => {}
        }
        {
            let state = self.state.lock();
            if state.shut_down {
                return Err(Error::precondition("node is shut down"));
            }
            if self.node_type == NodeType::Normal
                && (state.broker_link.is_some() || state.assigned_name.is_some())
            {
                return Err(Error::precondition("node is already connected to a broker"));
            }
        }
        Connector::start(self, transport, flags, initial_portals)
    }

    /// Register `link` under `name`. The first registration wins; false if
    /// `name` is already linked. Callers waiting on an introduction to
    /// `name` are resolved with the new link.
    pub fn add_link(&self, name: NodeName, link: Arc<NodeLink>) -> bool {
        match self.register_link(name, &link) {
            Some(callbacks) => {
                for callback in callbacks {
                    callback(Some(Arc::clone(&link)));
                }
                true
            }
            None => false,
        }
    }

    fn register_link(&self, name: NodeName, link: &Arc<NodeLink>) -> Option<Vec<LinkCallback>> {
        let callbacks = {
            let mut state = self.state.lock();
            if state.shut_down || state.links.contains_key(&name) {
                return None;
            }
            state.links.insert(name, Arc::clone(link));
            state.pending_introductions.remove(&name).unwrap_or_default()
        };
        counter!("fabric.links.registered").increment(1);
        debug!(local = %link.local_name(), remote = %name, side = %link.side(), "link registered");
        Some(callbacks)
    }

    /// Adopt `name` and make `link` our broker link, atomically.
    pub(crate) fn register_broker_link(
        &self,
        name: NodeName,
        link: &Arc<NodeLink>,
        allocation_delegate: bool,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(Error::precondition("node is shut down"));
            }
            if state.broker_link.is_some() {
                return Err(Error::precondition("broker link already established"));
            }
            if state.links.contains_key(&link.remote_name()) {
                return Err(Error::precondition("broker is already linked"));
            }
            state.assign_name(self.node_type, name)?;
            state.links.insert(link.remote_name(), Arc::clone(link));
            state.broker_link = Some(Arc::clone(link));
            if allocation_delegate {
                state.allocation_delegate_link = Some(Arc::clone(link));
            }
        }
        counter!("fabric.links.registered").increment(1);
        debug!(%name, broker = %link.remote_name(), allocation_delegate, "broker link registered");
        Ok(())
    }

    pub(crate) fn flush_broker_link_callbacks(&self) {
        let (link, callbacks) = {
            let mut state = self.state.lock();
            let Some(link) = state.broker_link.clone() else {
                return;
            };
            (link, std::mem::take(&mut state.broker_link_callbacks))
        };
        for callback in callbacks {
            callback(Some(Arc::clone(&link)));
        }
    }

    /// Remove and deactivate the link to `name`. Idempotent.
    pub fn drop_link(&self, name: NodeName) {
        self.unregister_link(name, None);
    }

    pub(crate) fn handle_link_error(&self, link: &Arc<NodeLink>) {
        if !self.unregister_link(link.remote_name(), Some(link)) {
            link.deactivate();
        }
    }

    /// Remove the link registered under `name`, if it is `only` (or any
    /// link when `only` is `None`).
    fn unregister_link(&self, name: NodeName, only: Option<&Arc<NodeLink>>) -> bool {
        let (link, orphaned) = {
            let mut state = self.state.lock();
            match (state.links.get(&name), only) {
                (None, _) => return false,
                (Some(current), Some(only)) if !Arc::ptr_eq(current, only) => return false,
                _ => {}
            }
            let Some(link) = state.links.remove(&name) else {
                return false;
            };
            let mut orphaned = Vec::new();
            if state.is_broker_link(&link) {
                state.broker_link = None;
                orphaned.extend(
                    state
                        .pending_introductions
                        .drain()
                        .flat_map(|(_, callbacks)| callbacks),
                );
            }
            if state
                .allocation_delegate_link
                .as_ref()
                .is_some_and(|delegate| Arc::ptr_eq(delegate, &link))
            {
                state.allocation_delegate_link = None;
            }
            (link, orphaned)
        };
        link.deactivate();
        debug!(remote = %name, "link dropped");
        for callback in orphaned {
            callback(None);
        }
        true
    }

    /// Get a link to `name`, asking the broker for an introduction if there
    /// is none yet. `callback` runs exactly once, possibly before this
    /// returns; `None` means the introduction failed.
    pub fn establish_link(&self, name: NodeName, callback: LinkCallback) {
        let request = {
            let mut state = self.state.lock();
            if let Some(link) = state.links.get(&name).cloned() {
                drop(state);
                callback(Some(link));
                return;
            }
            let broker = state
                .broker_link
                .clone()
                .filter(|_| !state.shut_down && state.assigned_name != Some(name));
            let Some(broker) = broker else {
                drop(state);
                callback(None);
                return;
            };
            let pending = state.pending_introductions.entry(name).or_default();
            pending.push(callback);
            if pending.len() > 1 {
                return;
            }
            broker
        };

        debug!(%name, "requesting introduction");
        if let Err(e) = request.request_introduction(name) {
            warn!(error = %e, %name, "failed to request introduction");
            self.resolve_introduction(name, None);
        }
    }

    pub async fn establish_link_async(&self, name: NodeName) -> Option<Arc<NodeLink>> {
        let (tx, rx) = oneshot::channel();
        self.establish_link(
            name,
            Box::new(move |link| {
                let _ = tx.send(link);
            }),
        );
        rx.await.ok().flatten()
    }

    fn resolve_introduction(&self, name: NodeName, link: Option<Arc<NodeLink>>) {
        let callbacks = self
            .state
            .lock()
            .pending_introductions
            .remove(&name)
            .unwrap_or_default();
        for callback in callbacks {
            callback(link.clone());
        }
    }

    /// Broker side of an introduction: `from` wants a link to `for_node`.
    /// Unknown targets are dropped silently; a pair already being introduced
    /// is ignored.
    pub fn handle_introduction_request(
        &self,
        from: &Arc<NodeLink>,
        for_node: NodeName,
    ) -> Result<()> {
        if self.node_type != NodeType::Broker {
            return Err(Error::precondition("introduction requested from a non-broker"));
        }
        let requester = from.remote_name();
        if requester == for_node {
            return Err(Error::invalid_argument("node asked to be introduced to itself"));
        }

        let pair = NamePair::new(requester, for_node);
        let target = {
            let mut state = self.state.lock();
            let Some(target) = state.links.get(&for_node).cloned() else {
                debug!(%requester, %for_node, "introduction target unknown");
                return Ok(());
            };
            if !state.in_progress_introductions.insert(pair) {
                debug!(%requester, %for_node, "introduction already in progress");
                return Ok(());
            }
            target
        };

        self.introduce(from, &target);
        self.state.lock().in_progress_introductions.remove(&pair);
        Ok(())
    }

    fn introduce(&self, requester: &Arc<NodeLink>, target: &Arc<NodeLink>) {
        let protocol_version = requester
            .protocol_version()
            .min(target.protocol_version());
        let resources = self.driver.create_transports().and_then(|transports| {
            let primary =
                NodeLinkMemory::allocate_primary(self.driver.as_ref(), &self.config.memory)?;
            Ok((transports, primary))
        });
        let ((for_requester, for_target), primary) = match resources {
            Ok(resources) => resources,
            Err(e) => {
                warn!(error = %e, "cannot introduce nodes");
                for (link, name) in [
                    (requester, target.remote_name()),
                    (target, requester.remote_name()),
                ] {
                    if let Err(e) = link.cancel_introduction(name) {
                        warn!(error = %e, "failed to cancel introduction");
                    }
                }
                return;
            }
        };

        let layout = self.config.memory.link_layout();
        let sent = requester
            .accept_introduction(
                target.remote_name(),
                LinkSide::A,
                target.remote_node_type(),
                protocol_version,
                layout.clone(),
                for_requester,
                Arc::clone(&primary),
            )
            .and_then(|()| {
                target.accept_introduction(
                    requester.remote_name(),
                    LinkSide::B,
                    requester.remote_node_type(),
                    protocol_version,
                    layout,
                    for_target,
                    primary,
                )
            });
        match sent {
            Ok(()) => {
                counter!("fabric.introductions.brokered").increment(1);
                debug!(a = %requester.remote_name(), b = %target.remote_name(), "introduced nodes");
            }
            Err(e) => warn!(error = %e, "introduction delivery failed"),
        }
    }

    /// Build, register and activate the link the broker introduced us to.
    /// A second introduction to an already linked node is discarded. A
    /// `layout` other than ours fails the introduction.
    #[allow(clippy::too_many_arguments)]
    pub fn accept_introduction(
        self: &Arc<Self>,
        from: &Arc<NodeLink>,
        name: NodeName,
        side: LinkSide,
        remote_node_type: NodeType,
        protocol_version: u32,
        layout: &LinkLayout,
        transport: Arc<dyn Transport>,
        memory: Arc<dyn SharedMemory>,
    ) -> Result<()> {
        let local_name = {
            let state = self.state.lock();
            if !state.is_broker_link(from) {
                return Err(Error::precondition("introduction from a non-broker link"));
            }
            state
                .assigned_name
                .ok_or_else(|| Error::precondition("introduced before being named"))?
        };
        if name == local_name {
            return Err(Error::invalid_argument("introduced to ourselves"));
        }
        if let Err(e) = self.config.memory.check_link_layout(layout) {
            self.resolve_introduction(name, None);
            return Err(e);
        }

        let link_memory = NodeLinkMemory::adopt(
            Arc::downgrade(self),
            Arc::clone(&self.driver),
            self.config.memory.clone(),
            memory,
        )?;
        let link = NodeLink::create_inactive(
            self,
            LinkParams {
                side,
                local_name,
                remote_name: name,
                remote_node_type,
                protocol_version: protocol_version.min(self.config.protocol_version),
            },
            transport,
            link_memory,
        );

        let Some(callbacks) = self.register_link(name, &link) else {
            debug!(%name, "already linked; discarding introduction");
            link.deactivate();
            return Ok(());
        };
        let link = match link.activate() {
            Ok(()) => Some(link),
            Err(e) => {
                warn!(error = %e, %name, "introduced link failed to activate");
                self.unregister_link(name, Some(&link));
                None
            }
        };
        for callback in callbacks {
            callback(link.clone());
        }
        Ok(())
    }

    /// The broker gave up introducing us to `name`.
    pub fn cancel_introduction(&self, from: &Arc<NodeLink>, name: NodeName) -> Result<()> {
        if !self.state.lock().is_broker_link(from) {
            return Err(Error::precondition("cancellation from a non-broker link"));
        }
        debug!(%name, "introduction cancelled");
        self.resolve_introduction(name, None);
        Ok(())
    }

    /// Send a routed payload to `destination` through the broker.
    pub fn send_relayed(
        &self,
        destination: NodeName,
        payload: &[u8],
        objects: Vec<DriverObject>,
    ) -> Result<()> {
        let broker = self
            .broker_link()
            .ok_or_else(|| Error::precondition("no broker link"))?;
        let inner = Message::Routed {
            payload: payload.to_vec(),
        }
        .encode()?;
        broker.relay(destination, inner.to_vec(), objects)
    }

    /// Broker role: forward `data` from `from` to `destination`. Unknown
    /// destinations are dropped.
    pub fn relay_message(
        &self,
        from: &Arc<NodeLink>,
        destination: NodeName,
        data: Vec<u8>,
        objects: Vec<DriverObject>,
    ) -> Result<()> {
        if self.node_type != NodeType::Broker {
            return Err(Error::precondition("relay requested from a non-broker"));
        }
        let Some(target) = self.link(destination) else {
            debug!(%destination, "relay destination unknown");
            return Ok(());
        };
        if let Err(e) = target.deliver_relayed(from.remote_name(), data, objects) {
            warn!(error = %e, %destination, "relay failed");
        }
        Ok(())
    }

    /// Handle a message the broker relayed from `source` as if `source` had
    /// sent it directly.
    pub fn accept_relayed_message(
        &self,
        from: &Arc<NodeLink>,
        source: NodeName,
        data: Vec<u8>,
        objects: Vec<DriverObject>,
    ) -> Result<()> {
        if !self.state.lock().is_broker_link(from) {
            return Err(Error::precondition("relayed message from a non-broker link"));
        }
        match Message::decode(&data)? {
            Message::Routed { payload } => {
                self.dispatch_routed(source, Bytes::from(payload), objects)
            }
            other => Err(Error::invalid_argument(format!(
                "{} cannot be relayed",
                other.kind()
            ))),
        }
    }

    pub fn set_routed_message_handler(&self, handler: Arc<dyn RoutedMessageHandler>) {
        *self.routed_handler.write() = Some(handler);
    }

    pub(crate) fn dispatch_routed(
        &self,
        from: NodeName,
        payload: Bytes,
        objects: Vec<DriverObject>,
    ) -> Result<()> {
        let handler = self.routed_handler.read().clone();
        match handler {
            Some(handler) => handler.on_routed_message(from, payload, objects),
            None => {
                debug!(%from, "no routed message handler; dropping payload");
                Ok(())
            }
        }
    }

    /// Run `callback` with the broker link once there is one. Brokers and
    /// shut down nodes get `None` straight away.
    pub fn wait_for_broker_link(&self, callback: LinkCallback) {
        let link = {
            let mut state = self.state.lock();
            if self.node_type == NodeType::Broker || state.shut_down {
                None
            } else if let Some(link) = &state.broker_link {
                Some(Arc::clone(link))
            } else {
                state.broker_link_callbacks.push(callback);
                return;
            }
        };
        callback(link);
    }

    pub async fn wait_for_broker_link_async(&self) -> Option<Arc<NodeLink>> {
        let (tx, rx) = oneshot::channel();
        self.wait_for_broker_link(Box::new(move |link| {
            let _ = tx.send(link);
        }));
        rx.await.ok().flatten()
    }

    /// Allocate shared memory, through the allocation delegate if we have
    /// one and directly from the driver otherwise.
    pub fn allocate_shared_memory(&self, size: usize, callback: MemoryCallback) {
        let delegate = self.state.lock().allocation_delegate_link.clone();
        match delegate {
            Some(link) => link.request_memory(size, callback),
            None => {
                let memory = self
                    .driver
                    .allocate_shared_memory(size)
                    .map_err(|e| warn!(error = %e, size, "shared memory allocation failed"))
                    .ok();
                callback(memory);
            }
        }
    }

    pub async fn allocate_shared_memory_async(
        &self,
        size: usize,
    ) -> Option<Arc<dyn SharedMemory>> {
        let (tx, rx) = oneshot::channel();
        self.allocate_shared_memory(
            size,
            Box::new(move |memory| {
                let _ = tx.send(memory);
            }),
        );
        rx.await.ok().flatten()
    }

    /// Serve a `RequestMemory` from a node delegating allocation to us.
    pub(crate) fn handle_memory_request(
        &self,
        from: &Arc<NodeLink>,
        request_id: u64,
        size: u64,
    ) -> Result<()> {
        let size = usize::try_from(size)
            .ok()
            .filter(|&size| size > 0)
            .ok_or_else(|| Error::invalid_argument(format!("bad memory request size {size}")))?;
        let link = Arc::clone(from);
        self.allocate_shared_memory(
            size,
            Box::new(move |memory| {
                if let Err(e) = link.provide_memory(request_id, size as u64, memory) {
                    warn!(error = %e, "failed to provide memory");
                }
            }),
        );
        Ok(())
    }

    /// Deactivate every link and fail everything still waiting.
    pub fn shut_down(&self) {
        let (links, callbacks) = {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.broker_link = None;
            state.allocation_delegate_link = None;
            state.in_progress_introductions.clear();
            let links: Vec<_> = state.links.drain().map(|(_, link)| link).collect();
            let mut callbacks: Vec<LinkCallback> = state
                .pending_introductions
                .drain()
                .flat_map(|(_, callbacks)| callbacks)
                .collect();
            callbacks.append(&mut state.broker_link_callbacks);
            (links, callbacks)
        };
        debug!(links = links.len(), "shutting down node");
        for link in links {
            link.deactivate();
        }
        for callback in callbacks {
            callback(None);
        }
    }

    pub fn links(&self) -> Vec<Arc<NodeLink>> {
        self.state.lock().links.values().cloned().collect()
    }

    pub fn link(&self, name: NodeName) -> Option<Arc<NodeLink>> {
        self.state.lock().links.get(&name).cloned()
    }

    pub fn broker_link(&self) -> Option<Arc<NodeLink>> {
        self.state.lock().broker_link.clone()
    }

    pub fn allocation_delegate_link(&self) -> Option<Arc<NodeLink>> {
        self.state.lock().allocation_delegate_link.clone()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Node")
            .field("type", &self.node_type)
            .field("name", &state.assigned_name)
            .field("links", &state.links.len())
            .finish()
    }
}
