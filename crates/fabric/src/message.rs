//! Messages exchanged over a node link.
//!
//! Messages are serde values encoded with bincode into the data half of a
//! [`TransportMessage`]. Driver objects ride in the objects half, in the
//! order each variant's documentation lists them.

use bincode::Options;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::LinkLayout;
use crate::driver::{DriverObject, SharedMemory, Transport, TransportMessage};
use crate::error::{Error, Result};
use crate::fragment::BufferId;
use crate::node::NodeType;
use crate::node_link::LinkSide;
use crate::node_name::NodeName;

/// Upper bound on an encoded message; anything larger is rejected unread.
pub const MAX_MESSAGE_SIZE: u64 = 4 * 1024 * 1024;

fn codec() -> impl Options {
    bincode::options().with_limit(MAX_MESSAGE_SIZE)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Normal node to broker, first message on a fresh transport.
    ConnectToBroker {
        protocol_version: u32,
        num_initial_portals: u32,
        layout: LinkLayout,
    },

    /// Broker's reply, naming both sides. Objects: primary link memory.
    ConnectFromBroker {
        broker_name: NodeName,
        receiver_name: NodeName,
        protocol_version: u32,
        num_initial_portals: u32,
        layout: LinkLayout,
    },

    /// Ask the broker to introduce us to `name`.
    RequestIntroduction { name: NodeName },

    /// Broker to each party of an introduction. Objects: transport, primary
    /// link memory.
    AcceptIntroduction {
        name: NodeName,
        side: LinkSide,
        remote_node_type: NodeType,
        protocol_version: u32,
        layout: LinkLayout,
    },

    /// Broker could not complete an introduction to `name`.
    CancelIntroduction { name: NodeName },

    /// A new buffer of `num_blocks` blocks for link memory. Objects: the
    /// buffer.
    AddBlockBuffer {
        buffer_id: BufferId,
        block_size: u32,
        num_blocks: u32,
    },

    /// Ask the allocation delegate for shared memory.
    RequestMemory { request_id: u64, size: u64 },

    /// Delegate's reply to `request_id`. Objects: the memory, or nothing on
    /// failure.
    ProvideMemory { request_id: u64, size: u64 },

    /// Ask the broker to forward `data` to `destination`. Objects: passed
    /// through.
    RelayMessage { destination: NodeName, data: Vec<u8> },

    /// A message relayed by the broker on behalf of `source`. Objects:
    /// passed through.
    AcceptRelayedMessage { source: NodeName, data: Vec<u8> },

    /// Opaque payload for the routing layer. Objects: passed through.
    Routed { payload: Vec<u8> },
}

impl Message {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(codec().serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(codec().deserialize(data)?)
    }

    /// Encode and attach `objects`.
    pub fn into_transport(self, objects: Vec<DriverObject>) -> Result<TransportMessage> {
        Ok(TransportMessage::new(self.encode()?, objects))
    }

    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ConnectToBroker { .. } => "ConnectToBroker",
            Message::ConnectFromBroker { .. } => "ConnectFromBroker",
            Message::RequestIntroduction { .. } => "RequestIntroduction",
            Message::AcceptIntroduction { .. } => "AcceptIntroduction",
            Message::CancelIntroduction { .. } => "CancelIntroduction",
            Message::AddBlockBuffer { .. } => "AddBlockBuffer",
            Message::RequestMemory { .. } => "RequestMemory",
            Message::ProvideMemory { .. } => "ProvideMemory",
            Message::RelayMessage { .. } => "RelayMessage",
            Message::AcceptRelayedMessage { .. } => "AcceptRelayedMessage",
            Message::Routed { .. } => "Routed",
        }
    }
}

/// Unpack the objects of a message that carries exactly one memory object.
pub(crate) fn expect_memory(objects: Vec<DriverObject>) -> Result<Arc<dyn SharedMemory>> {
    let mut objects = objects.into_iter();
    match (objects.next(), objects.next()) {
        (Some(DriverObject::Memory(memory)), None) => Ok(memory),
        _ => Err(Error::invalid_argument("expected exactly one memory object")),
    }
}

/// Like [`expect_memory`], but zero objects is also acceptable.
pub(crate) fn optional_memory(objects: Vec<DriverObject>) -> Result<Option<Arc<dyn SharedMemory>>> {
    if objects.is_empty() {
        return Ok(None);
    }
    expect_memory(objects).map(Some)
}

/// Unpack a transport followed by a memory object.
pub(crate) fn expect_transport_and_memory(
    objects: Vec<DriverObject>,
) -> Result<(Arc<dyn Transport>, Arc<dyn SharedMemory>)> {
    let mut objects = objects.into_iter();
    match (objects.next(), objects.next(), objects.next()) {
        (Some(DriverObject::Transport(transport)), Some(DriverObject::Memory(memory)), None) => {
            Ok((transport, memory))
        }
        _ => Err(Error::invalid_argument(
            "expected a transport and a memory object",
        )),
    }
}
