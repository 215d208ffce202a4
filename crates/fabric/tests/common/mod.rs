//! Shared fixtures: a broker plus normal nodes on the in-process driver.

#![allow(dead_code)]

use std::sync::Arc;

use fabric::driver::local::LocalDriver;
use fabric::driver::{Driver, Transport, TransportListener, TransportMessage};
use fabric::message::Message;
use fabric::{ConnectFlags, Node, NodeConfig, NodeName, NodeType, PortalHandle, Result};
use parking_lot::Mutex;

pub struct Cluster {
    pub driver: Arc<LocalDriver>,
    pub broker: Arc<Node>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_driver(LocalDriver::new())
    }

    pub fn with_driver(driver: Arc<LocalDriver>) -> Self {
        let broker = Node::new(NodeType::Broker, driver.clone());
        Self { driver, broker }
    }

    pub fn with_config(config: NodeConfig) -> Self {
        let driver = LocalDriver::new();
        let broker = Node::builder(NodeType::Broker, driver.clone())
            .with_config(config)
            .build()
            .unwrap();
        Self { driver, broker }
    }

    /// A fresh normal node, connected to the broker as its broker.
    pub fn join(&self) -> Arc<Node> {
        let node = Node::builder(NodeType::Normal, self.driver.clone())
            .with_config(self.broker.config().clone())
            .build()
            .unwrap();
        self.connect(&node, ConnectFlags::TO_BROKER, &[], &[]);
        node
    }

    /// Run the handshake between the broker and `node`.
    pub fn connect(
        &self,
        node: &Arc<Node>,
        flags: ConnectFlags,
        broker_portals: &[PortalHandle],
        node_portals: &[PortalHandle],
    ) {
        let (for_broker, for_node) = self.driver.create_transports().unwrap();
        self.broker
            .connect_node(for_broker, ConnectFlags::NONE, broker_portals)
            .unwrap();
        node.connect_node(for_node, flags, node_portals).unwrap();
    }
}

impl Cluster {
    /// Like [`Cluster::connect`], but the node's end of the link can hold
    /// back what the node sends.
    pub fn connect_held(&self, node: &Arc<Node>, flags: ConnectFlags) -> Arc<HeldTransport> {
        let (for_broker, for_node) = self.driver.create_transports().unwrap();
        let held = HeldTransport::new(for_node);
        self.broker
            .connect_node(for_broker, ConnectFlags::NONE, &[])
            .unwrap();
        node.connect_node(held.clone(), flags, &[]).unwrap();
        held
    }
}

/// Transport wrapper that queues outgoing messages while holding.
pub struct HeldTransport {
    inner: Arc<dyn Transport>,
    held: Mutex<Option<Vec<TransportMessage>>>,
}

impl HeldTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            held: Mutex::new(None),
        })
    }

    pub fn hold(&self) {
        self.held.lock().get_or_insert_with(Vec::new);
    }

    /// Messages queued so far, decoded.
    pub fn held(&self) -> Vec<Message> {
        self.held
            .lock()
            .iter()
            .flatten()
            .map(|m| Message::decode(&m.data).unwrap())
            .collect()
    }

    /// Stop holding and send everything queued, in order.
    pub fn release(&self) {
        let queued = self.held.lock().take().unwrap_or_default();
        for message in queued {
            self.inner.transmit(message).unwrap();
        }
    }
}

impl Transport for HeldTransport {
    fn activate(&self, listener: Arc<dyn TransportListener>) -> Result<()> {
        self.inner.activate(listener)
    }

    fn deactivate(&self) {
        self.inner.deactivate();
    }

    fn transmit(&self, message: TransportMessage) -> Result<()> {
        if let Some(queue) = self.held.lock().as_mut() {
            queue.push(message);
            return Ok(());
        }
        self.inner.transmit(message)
    }
}

pub fn name(node: &Node) -> NodeName {
    node.assigned_name().expect("node has a name")
}
