//! A named, bidirectional connection between two nodes.
//!
//! A [`NodeLink`] is created inactive so its owner can register it before any
//! message can arrive on it, then [`activate`](NodeLink::activate)d. Incoming
//! messages are decoded here and handed to the owning [`Node`]; anything that
//! fails validation is reported to the driver as bad activity.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::LinkLayout;
use crate::driver::{Driver, DriverObject, SharedMemory, Transport, TransportListener, TransportMessage};
use crate::error::{Error, Result};
use crate::fragment::BufferId;
use crate::memory::NodeLinkMemory;
use crate::message::{self, Message};
use crate::node::{MemoryCallback, Node, NodeType};
use crate::node_name::NodeName;
use crate::validator::Validator;

/// Which end of a link this is. Fixed for the link's lifetime; the broker is
/// always side A of the links it accepts.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum LinkSide {
    A,
    B,
}

impl LinkSide {
    pub fn opposite(self) -> Self {
        match self {
            LinkSide::A => LinkSide::B,
            LinkSide::B => LinkSide::A,
        }
    }

    pub fn is_side_a(self) -> bool {
        self == LinkSide::A
    }
}

impl fmt::Display for LinkSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkSide::A => f.write_str("A"),
            LinkSide::B => f.write_str("B"),
        }
    }
}

/// Fixed properties of a link, settled by the handshake or introduction
/// that produced it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkParams {
    pub side: LinkSide,
    pub local_name: NodeName,
    pub remote_name: NodeName,
    pub remote_node_type: NodeType,
    pub protocol_version: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum LinkState {
    Inactive,
    Active,
    Deactivated,
}

pub struct NodeLink {
    node: Weak<Node>,
    driver: Arc<dyn Driver>,
    params: LinkParams,
    transport: Arc<dyn Transport>,
    memory: Arc<NodeLinkMemory>,
    state: Mutex<LinkState>,
    next_request_id: AtomicU64,
    memory_requests: Mutex<HashMap<u64, MemoryCallback>>,
}

impl NodeLink {
    /// Build a link without starting I/O on `transport`.
    pub fn create_inactive(
        node: &Arc<Node>,
        params: LinkParams,
        transport: Arc<dyn Transport>,
        memory: Arc<NodeLinkMemory>,
    ) -> Arc<Self> {
        let link = Arc::new(Self {
            node: Arc::downgrade(node),
            driver: Arc::clone(node.driver()),
            params,
            transport,
            memory,
            state: Mutex::new(LinkState::Inactive),
            next_request_id: AtomicU64::new(0),
            memory_requests: Mutex::new(HashMap::new()),
        });
        link.memory.set_link(&link);
        link
    }

    /// Start delivering incoming messages. Idempotent while active; fails
    /// once the link has been deactivated.
    pub fn activate(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                LinkState::Active => return Ok(()),
                LinkState::Deactivated => return Err(Error::LinkInactive),
                LinkState::Inactive => *state = LinkState::Active,
            }
        }
        let listener = Arc::new(LinkListener {
            link: Arc::downgrade(self),
        });
        if let Err(e) = self.transport.activate(listener) {
            *self.state.lock() = LinkState::Deactivated;
            return Err(e);
        }
        debug!(local = %self.local_name(), remote = %self.remote_name(), side = %self.side(), "link activated");
        Ok(())
    }

    /// Stop all I/O. Outstanding memory requests resolve with `None`.
    pub fn deactivate(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), LinkState::Deactivated);
        if previous == LinkState::Deactivated {
            return;
        }
        self.transport.deactivate();
        let requests = std::mem::take(&mut *self.memory_requests.lock());
        for (_, callback) in requests {
            callback(None);
        }
        debug!(local = %self.local_name(), remote = %self.remote_name(), "link deactivated");
    }

    pub fn is_active(&self) -> bool {
        *self.state.lock() == LinkState::Active
    }

    pub fn side(&self) -> LinkSide {
        self.params.side
    }

    pub fn local_name(&self) -> NodeName {
        self.params.local_name
    }

    pub fn remote_name(&self) -> NodeName {
        self.params.remote_name
    }

    pub fn remote_node_type(&self) -> NodeType {
        self.params.remote_node_type
    }

    pub fn protocol_version(&self) -> u32 {
        self.params.protocol_version
    }

    pub fn memory(&self) -> &Arc<NodeLinkMemory> {
        &self.memory
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// A validator bound to this link.
    pub fn validator(self: &Arc<Self>) -> Validator {
        Validator::new(self)
    }

    /// Send an opaque payload to the routing layer on the other side.
    pub fn send_routed(&self, payload: &[u8], objects: Vec<DriverObject>) -> Result<()> {
        self.transmit(
            Message::Routed {
                payload: payload.to_vec(),
            },
            objects,
        )
    }

    pub fn request_introduction(&self, name: NodeName) -> Result<()> {
        self.transmit(Message::RequestIntroduction { name }, Vec::new())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn accept_introduction(
        &self,
        name: NodeName,
        side: LinkSide,
        remote_node_type: NodeType,
        protocol_version: u32,
        layout: LinkLayout,
        transport: Arc<dyn Transport>,
        memory: Arc<dyn SharedMemory>,
    ) -> Result<()> {
        self.transmit(
            Message::AcceptIntroduction {
                name,
                side,
                remote_node_type,
                protocol_version,
                layout,
            },
            vec![DriverObject::Transport(transport), DriverObject::Memory(memory)],
        )
    }

    pub fn cancel_introduction(&self, name: NodeName) -> Result<()> {
        self.transmit(Message::CancelIntroduction { name }, Vec::new())
    }

    /// Announce a new link memory buffer to the peer.
    pub fn send_add_block_buffer(
        &self,
        buffer_id: BufferId,
        block_size: u32,
        num_blocks: u32,
        memory: Arc<dyn SharedMemory>,
    ) -> Result<()> {
        self.transmit(
            Message::AddBlockBuffer {
                buffer_id,
                block_size,
                num_blocks,
            },
            vec![DriverObject::Memory(memory)],
        )
    }

    /// Ask the peer, acting as allocation delegate, for `size` bytes of
    /// shared memory. `callback` receives `None` if the peer fails or the
    /// link goes away first.
    pub fn request_memory(&self, size: usize, callback: MemoryCallback) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.memory_requests.lock().insert(request_id, callback);
        let sent = self.transmit(
            Message::RequestMemory {
                request_id,
                size: size as u64,
            },
            Vec::new(),
        );
        if let Err(e) = sent {
            warn!(error = %e, size, "failed to request memory from delegate");
            let callback = self.memory_requests.lock().remove(&request_id);
            if let Some(callback) = callback {
                callback(None);
            }
        }
    }

    pub(crate) fn provide_memory(
        &self,
        request_id: u64,
        size: u64,
        memory: Option<Arc<dyn SharedMemory>>,
    ) -> Result<()> {
        let objects = memory.map(DriverObject::Memory).into_iter().collect();
        self.transmit(Message::ProvideMemory { request_id, size }, objects)
    }

    pub(crate) fn relay(&self, destination: NodeName, data: Vec<u8>, objects: Vec<DriverObject>) -> Result<()> {
        self.transmit(Message::RelayMessage { destination, data }, objects)
    }

    pub(crate) fn deliver_relayed(
        &self,
        source: NodeName,
        data: Vec<u8>,
        objects: Vec<DriverObject>,
    ) -> Result<()> {
        self.transmit(Message::AcceptRelayedMessage { source, data }, objects)
    }

    /// Encode and send `message`. Allowed before activation; refused after
    /// deactivation.
    pub fn transmit(&self, message: Message, objects: Vec<DriverObject>) -> Result<()> {
        if *self.state.lock() == LinkState::Deactivated {
            return Err(Error::LinkInactive);
        }
        trace!(kind = message.kind(), remote = %self.remote_name(), "transmit");
        self.transport.transmit(message.into_transport(objects)?)
    }

    pub(crate) fn report_bad_activity(&self, context: &str) {
        self.driver.report_bad_activity(self.transport.as_ref(), context);
    }

    fn on_transport_message(self: &Arc<Self>, message: TransportMessage) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let result = self.dispatch(message);
        if let Err(e) = &result {
            warn!(error = %e, remote = %self.remote_name(), "rejecting message");
            self.report_bad_activity(&e.to_string());
        }
        result
    }

    fn dispatch(self: &Arc<Self>, message: TransportMessage) -> Result<()> {
        let TransportMessage { data, objects } = message;
        let decoded = Message::decode(&data)?;
        trace!(kind = decoded.kind(), remote = %self.remote_name(), "received");
        let Some(node) = self.node.upgrade() else {
            return Ok(());
        };

        match decoded {
            Message::ConnectToBroker { .. } | Message::ConnectFromBroker { .. } => Err(
                Error::precondition("handshake message on an established link"),
            ),
            Message::RequestIntroduction { name } => node.handle_introduction_request(self, name),
            Message::AcceptIntroduction {
                name,
                side,
                remote_node_type,
                protocol_version,
                layout,
            } => {
                let (transport, memory) = message::expect_transport_and_memory(objects)?;
                node.accept_introduction(
                    self,
                    name,
                    side,
                    remote_node_type,
                    protocol_version,
                    &layout,
                    transport,
                    memory,
                )
            }
            Message::CancelIntroduction { name } => node.cancel_introduction(self, name),
            Message::AddBlockBuffer {
                buffer_id,
                block_size,
                num_blocks,
            } => {
                let memory = message::expect_memory(objects)?;
                self.memory
                    .add_block_buffer(buffer_id, block_size, num_blocks, memory)
            }
            Message::RequestMemory { request_id, size } => {
                node.handle_memory_request(self, request_id, size)
            }
            Message::ProvideMemory { request_id, .. } => {
                let memory = message::optional_memory(objects)?;
                let callback = self.memory_requests.lock().remove(&request_id);
                match callback {
                    Some(callback) => {
                        callback(memory);
                        Ok(())
                    }
                    None => Err(Error::invalid_argument(format!(
                        "unsolicited memory for request {request_id}"
                    ))),
                }
            }
            Message::RelayMessage { destination, data } => {
                node.relay_message(self, destination, data, objects)
            }
            Message::AcceptRelayedMessage { source, data } => {
                node.accept_relayed_message(self, source, data, objects)
            }
            Message::Routed { payload } => {
                node.dispatch_routed(self.remote_name(), Bytes::from(payload), objects)
            }
        }
    }

    fn on_transport_error(self: &Arc<Self>) {
        debug!(remote = %self.remote_name(), "transport error on link");
        match self.node.upgrade() {
            Some(node) => node.handle_link_error(self),
            None => self.deactivate(),
        }
    }
}

impl fmt::Debug for NodeLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeLink")
            .field("params", &self.params)
            .field("state", &*self.state.lock())
            .finish()
    }
}

struct LinkListener {
    link: Weak<NodeLink>,
}

impl TransportListener for LinkListener {
    fn on_message(&self, message: TransportMessage) -> Result<()> {
        match self.link.upgrade() {
            Some(link) => link.on_transport_message(message),
            None => Ok(()),
        }
    }

    fn on_error(&self) {
        if let Some(link) = self.link.upgrade() {
            link.on_transport_error();
        }
    }
}
