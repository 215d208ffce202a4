//! Handshake run on a fresh transport before it becomes a [`NodeLink`].
//!
//! A normal node opens with `ConnectToBroker`. The broker names the new node,
//! allocates the link's primary memory and answers with `ConnectFromBroker`.
//! Both messages carry the sender's [`LinkLayout`]; either side refuses a
//! peer whose layout differs from its own.
//! Each side then registers an inactive link, activates it (which replaces
//! the connector as the transport's listener) and binds its initial portals.

use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::config::LinkLayout;
use crate::driver::{DriverObject, Transport, TransportListener, TransportMessage};
use crate::error::{Error, Result};
use crate::memory::NodeLinkMemory;
use crate::message::{self, Message};
use crate::node::{Node, NodeType};
use crate::node_link::{LinkParams, LinkSide, NodeLink};
use crate::node_name::NodeName;
use crate::portal::{self, PortalHandle};

/// Options for [`Node::connect_node`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnectFlags(u32);

impl ConnectFlags {
    pub const NONE: ConnectFlags = ConnectFlags(0);

    /// The remote node is our broker.
    pub const TO_BROKER: ConnectFlags = ConnectFlags(1);

    /// The broker also allocates shared memory on our behalf.
    pub const TO_ALLOCATION_DELEGATE: ConnectFlags = ConnectFlags(1 << 1);

    pub fn contains(self, other: ConnectFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ConnectFlags {
    type Output = ConnectFlags;

    fn bitor(self, rhs: ConnectFlags) -> ConnectFlags {
        ConnectFlags(self.0 | rhs.0)
    }
}

pub(crate) struct Connector {
    node: Weak<Node>,
    transport: Arc<dyn Transport>,
    flags: ConnectFlags,
    portals: Vec<PortalHandle>,
    finished: AtomicBool,
}

impl Connector {
    pub(crate) fn start(
        node: &Arc<Node>,
        transport: Arc<dyn Transport>,
        flags: ConnectFlags,
        portals: &[PortalHandle],
    ) -> Result<()> {
        let connector = Arc::new(Connector {
            node: Arc::downgrade(node),
            transport: Arc::clone(&transport),
            flags,
            portals: portals.to_vec(),
            finished: AtomicBool::new(false),
        });
        transport.activate(connector.clone())?;

        if node.node_type() == NodeType::Normal {
            let hello = Message::ConnectToBroker {
                protocol_version: node.config().protocol_version,
                num_initial_portals: portals.len() as u32,
                layout: node.config().memory.link_layout(),
            };
            if let Err(e) = hello
                .into_transport(Vec::new())
                .and_then(|m| transport.transmit(m))
            {
                connector.fail();
                return Err(e);
            }
        }
        Ok(())
    }

    fn fail(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.deactivate();
        for portal in &self.portals {
            portal.close();
        }
    }

    fn handle(&self, message: TransportMessage) -> Result<()> {
        let Some(node) = self.node.upgrade() else {
            return Err(Error::precondition("node shut down during handshake"));
        };
        let TransportMessage { data, objects } = message;
        match (node.node_type(), Message::decode(&data)?) {
            (
                NodeType::Broker,
                Message::ConnectToBroker {
                    protocol_version,
                    num_initial_portals,
                    layout,
                },
            ) => {
                if !objects.is_empty() {
                    return Err(Error::invalid_argument("unexpected objects in ConnectToBroker"));
                }
                self.accept_client(&node, protocol_version, num_initial_portals, &layout)
            }
            (
                NodeType::Normal,
                Message::ConnectFromBroker {
                    broker_name,
                    receiver_name,
                    protocol_version,
                    num_initial_portals,
                    layout,
                },
            ) => self.accept_broker(
                &node,
                broker_name,
                receiver_name,
                protocol_version,
                num_initial_portals,
                &layout,
                objects,
            ),
            (_, other) => Err(Error::invalid_argument(format!(
                "unexpected {} during handshake",
                other.kind()
            ))),
        }
    }

    fn negotiate(&self, node: &Node, remote_version: u32) -> Result<u32> {
        if remote_version == 0 {
            return Err(Error::invalid_argument("protocol version 0"));
        }
        Ok(node.config().protocol_version.min(remote_version))
    }

    /// Broker side: name the caller and hand it the link memory.
    fn accept_client(
        &self,
        node: &Arc<Node>,
        remote_version: u32,
        remote_portals: u32,
        remote_layout: &LinkLayout,
    ) -> Result<()> {
        let protocol_version = self.negotiate(node, remote_version)?;
        let config = &node.config().memory;
        config.check_link_layout(remote_layout)?;
        let broker_name = node
            .assigned_name()
            .ok_or_else(|| Error::precondition("broker has no name"))?;
        let name = node.generate_name();

        let primary = NodeLinkMemory::allocate_primary(node.driver().as_ref(), config)?;
        let memory = NodeLinkMemory::adopt(
            Arc::downgrade(node),
            Arc::clone(node.driver()),
            config.clone(),
            Arc::clone(&primary),
        )?;
        let link = NodeLink::create_inactive(
            node,
            LinkParams {
                side: LinkSide::A,
                local_name: broker_name,
                remote_name: name,
                remote_node_type: NodeType::Normal,
                protocol_version,
            },
            Arc::clone(&self.transport),
            memory,
        );
        if !node.add_link(name, Arc::clone(&link)) {
            return Err(Error::precondition(format!("{name} is already linked")));
        }

        let reply = Message::ConnectFromBroker {
            broker_name,
            receiver_name: name,
            protocol_version,
            num_initial_portals: self.portals.len() as u32,
            layout: config.link_layout(),
        };
        if let Err(e) = link.transmit(reply, vec![DriverObject::Memory(primary)]) {
            node.drop_link(name);
            return Err(e);
        }
        self.finish(node, &link, name, remote_portals)?;
        debug!(%name, "accepted node");
        Ok(())
    }

    /// Normal side: adopt our name and the broker link.
    #[allow(clippy::too_many_arguments)]
    fn accept_broker(
        &self,
        node: &Arc<Node>,
        broker_name: NodeName,
        receiver_name: NodeName,
        remote_version: u32,
        remote_portals: u32,
        remote_layout: &LinkLayout,
        objects: Vec<DriverObject>,
    ) -> Result<()> {
        let protocol_version = self.negotiate(node, remote_version)?;
        if broker_name == receiver_name {
            return Err(Error::invalid_argument("broker assigned its own name"));
        }
        let config = &node.config().memory;
        config.check_link_layout(remote_layout)?;
        let primary = message::expect_memory(objects)?;
        let memory = NodeLinkMemory::adopt(
            Arc::downgrade(node),
            Arc::clone(node.driver()),
            config.clone(),
            primary,
        )?;
        let link = NodeLink::create_inactive(
            node,
            LinkParams {
                side: LinkSide::B,
                local_name: receiver_name,
                remote_name: broker_name,
                remote_node_type: NodeType::Broker,
                protocol_version,
            },
            Arc::clone(&self.transport),
            memory,
        );
        let delegate = self.flags.contains(ConnectFlags::TO_ALLOCATION_DELEGATE);
        node.register_broker_link(receiver_name, &link, delegate)?;
        self.finish(node, &link, broker_name, remote_portals)?;
        node.flush_broker_link_callbacks();
        debug!(name = %receiver_name, broker = %broker_name, "connected to broker");
        Ok(())
    }

    fn finish(
        &self,
        node: &Arc<Node>,
        link: &Arc<NodeLink>,
        remote: NodeName,
        remote_portals: u32,
    ) -> Result<()> {
        self.finished.store(true, Ordering::Release);
        if let Err(e) = link.activate() {
            node.drop_link(remote);
            return Err(e);
        }
        let usable = self.portals.len().min(remote_portals as usize);
        portal::bind_initial_portals(&self.portals, remote, usable);
        Ok(())
    }
}

impl TransportListener for Connector {
    fn on_message(&self, message: TransportMessage) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = self.handle(message);
        if let Err(e) = &result {
            warn!(error = %e, "handshake failed");
            if let Some(node) = self.node.upgrade() {
                node.driver()
                    .report_bad_activity(self.transport.as_ref(), &e.to_string());
            }
            self.fail();
        }
        result
    }

    fn on_error(&self) {
        if !self.finished.load(Ordering::Acquire) {
            debug!("transport closed during handshake");
            self.fail();
        }
    }
}
