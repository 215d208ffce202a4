//! # fabric
//!
//! Node interconnection for an IPC system: identity, broker-mediated
//! introductions, and shared-memory backed links.
//!
//! ## Core Concepts
//!
//! - **Node**: a process-level participant, either a broker or a normal node
//! - **NodeLink**: one named connection between two nodes
//! - **NodeLinkMemory**: the shared memory pool behind each link
//! - **Fragment**: a block of link memory, addressable by either peer
//! - **Driver**: the embedder-supplied transport and memory capability
//!
//! ## Example
//!
//! ```
//! use fabric::driver::local::LocalDriver;
//! use fabric::driver::Driver;
//! use fabric::{ConnectFlags, Node, NodeType};
//!
//! let driver = LocalDriver::new();
//! let broker = Node::new(NodeType::Broker, driver.clone());
//! let node = Node::new(NodeType::Normal, driver.clone());
//!
//! let (a, b) = driver.create_transports().unwrap();
//! broker.connect_node(a, ConnectFlags::NONE, &[]).unwrap();
//! node.connect_node(b, ConnectFlags::TO_BROKER, &[]).unwrap();
//!
//! let link = node.broker_link().unwrap();
//! let fragment = link.memory().allocate_fragment(200);
//! assert_eq!(fragment.size(), 256);
//! ```

pub mod config;
pub mod connector;
pub mod driver;
pub mod error;
pub mod fragment;
pub mod memory;
pub mod message;
pub mod node;
pub mod node_link;
pub mod node_name;
pub mod portal;
pub mod validator;

pub use config::{MemoryConfig, NodeConfig, PrimaryClass};
pub use connector::ConnectFlags;
pub use error::{Error, Result};
pub use fragment::{BufferId, Fragment, FragmentDescriptor};
pub use memory::NodeLinkMemory;
pub use node::{Node, NodeBuilder, NodeType, RoutedMessageHandler};
pub use node_link::{LinkSide, NodeLink};
pub use node_name::{IdentityAuthority, NodeName, RandomNameAuthority};
pub use portal::{PortalHandle, PortalState};
pub use validator::Validator;
