//! Driver capability surface.
//!
//! The fabric never touches OS primitives directly. Everything that moves
//! bytes, maps memory or produces entropy is reached through the traits in
//! this module, implemented by an embedder-supplied driver. The in-process
//! [`local::LocalDriver`] is provided for tests and single-process use.

pub mod local;

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

/// Opaque handle the embedder associates with a node; passed through untouched.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct DriverNodeHandle(pub u64);

/// Capabilities the fabric consumes from its driver.
pub trait Driver: Send + Sync + 'static {
    /// Create a pair of connected transports.
    fn create_transports(&self) -> Result<(Arc<dyn Transport>, Arc<dyn Transport>)>;

    /// Allocate a new shared memory region of `size` bytes, zero-filled.
    fn allocate_shared_memory(&self, size: usize) -> Result<Arc<dyn SharedMemory>>;

    /// Fill `out` with cryptographically random bytes.
    fn generate_random_bytes(&self, out: &mut [u8]);

    /// Report misbehaviour observed on `transport`. The driver decides what
    /// to do with the offending peer.
    fn report_bad_activity(&self, transport: &dyn Transport, context: &str);
}

/// One endpoint of a bidirectional byte-and-handle pipe.
pub trait Transport: Send + Sync + 'static {
    /// Start delivering incoming messages to `listener`. Activating an active
    /// transport replaces its listener; messages not yet delivered go to the
    /// new one.
    fn activate(&self, listener: Arc<dyn TransportListener>) -> Result<()>;

    /// Stop delivering messages. Idempotent.
    fn deactivate(&self);

    /// Send a message to the peer endpoint.
    fn transmit(&self, message: TransportMessage) -> Result<()>;
}

/// Receiver of transport events.
pub trait TransportListener: Send + Sync + 'static {
    /// Handle one incoming message. An error means the message failed
    /// validation; the transport reports it as bad activity.
    fn on_message(&self, message: TransportMessage) -> Result<()>;

    /// The transport broke and will deliver nothing further.
    fn on_error(&self);
}

/// A shared memory object. Cloning the `Arc` duplicates the handle.
pub trait SharedMemory: Send + Sync + 'static {
    fn size(&self) -> usize;

    /// Map the whole region into this process.
    fn map(&self) -> Result<Arc<dyn MemoryMapping>>;
}

/// A mapped view of a [`SharedMemory`] region.
pub trait MemoryMapping: Send + Sync + 'static {
    /// Base address, aligned to at least 8 bytes.
    fn base(&self) -> NonNull<u8>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A driver object carried alongside message bytes.
#[derive(Clone)]
pub enum DriverObject {
    Transport(Arc<dyn Transport>),
    Memory(Arc<dyn SharedMemory>),
}

impl DriverObject {
    pub fn into_transport(self) -> Option<Arc<dyn Transport>> {
        match self {
            DriverObject::Transport(t) => Some(t),
            DriverObject::Memory(_) => None,
        }
    }

    pub fn into_memory(self) -> Option<Arc<dyn SharedMemory>> {
        match self {
            DriverObject::Memory(m) => Some(m),
            DriverObject::Transport(_) => None,
        }
    }
}

impl fmt::Debug for DriverObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverObject::Transport(_) => f.write_str("DriverObject::Transport"),
            DriverObject::Memory(m) => write!(f, "DriverObject::Memory({} bytes)", m.size()),
        }
    }
}

/// Unit of transmission: opaque bytes plus attached driver objects.
#[derive(Debug, Clone, Default)]
pub struct TransportMessage {
    pub data: Bytes,
    pub objects: Vec<DriverObject>,
}

impl TransportMessage {
    pub fn new(data: impl Into<Bytes>, objects: Vec<DriverObject>) -> Self {
        Self {
            data: data.into(),
            objects,
        }
    }
}
