//! In-process reference driver.
//!
//! Transports are pairs of inboxes living in the same process. Delivery is
//! trampolined: whichever thread pushes into an idle inbox drains it,
//! invoking the listener with no driver locks held, while concurrent pushers
//! only enqueue. This keeps delivery FIFO per transport and bounds
//! re-entrancy when a listener transmits from inside its own callback.
//!
//! Shared memory is plain heap storage; every mapping of one object aliases
//! the same bytes, which is exactly what two peers in one process need.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use rand::RngCore;
use tracing::{trace, warn};

use crate::driver::{
    Driver, MemoryMapping, SharedMemory, Transport, TransportListener, TransportMessage,
};
use crate::error::{Error, Result};

/// Reference driver for single-process use.
#[derive(Debug, Default)]
pub struct LocalDriver {
    memory_limit: Option<usize>,
    allocated: AtomicUsize,
    bad_activity: Mutex<Vec<String>>,
}

impl LocalDriver {
    /// A driver with unlimited shared memory.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A driver that refuses allocations once `limit` bytes have been handed
    /// out in total.
    pub fn with_memory_limit(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            memory_limit: Some(limit),
            ..Self::default()
        })
    }

    /// Total bytes of shared memory allocated so far.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Every bad-activity context reported so far, oldest first.
    pub fn bad_activity_reports(&self) -> Vec<String> {
        self.bad_activity.lock().clone()
    }
}

impl Driver for LocalDriver {
    fn create_transports(&self) -> Result<(Arc<dyn Transport>, Arc<dyn Transport>)> {
        let (a, b) = LocalTransport::pair();
        Ok((a, b))
    }

    fn allocate_shared_memory(&self, size: usize) -> Result<Arc<dyn SharedMemory>> {
        if size == 0 {
            return Err(Error::invalid_argument("zero-sized shared memory"));
        }
        let reserved = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(size)?;
                match self.memory_limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            });
        if reserved.is_err() {
            return Err(Error::driver(format!(
                "shared memory limit reached allocating {size} bytes"
            )));
        }
        Ok(Arc::new(LocalMemory {
            region: Arc::new(Region::new(size)),
        }))
    }

    fn generate_random_bytes(&self, out: &mut [u8]) {
        rand::thread_rng().fill_bytes(out);
    }

    fn report_bad_activity(&self, _transport: &dyn Transport, context: &str) {
        warn!(context, "bad activity reported on local transport");
        self.bad_activity.lock().push(context.to_string());
    }
}

enum Event {
    Message(TransportMessage),
    Disconnected,
}

#[derive(Default)]
struct Inbox {
    queue: SegQueue<Event>,
    listener: Mutex<Option<Arc<dyn TransportListener>>>,
    draining: AtomicBool,
    closed: AtomicBool,
    rejected: Mutex<Vec<String>>,
}

impl Inbox {
    fn current_listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.lock().clone()
    }

    /// Deliver queued events until the queue is empty or nobody listens.
    fn pump(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            while let Some(listener) = self.current_listener() {
                let Some(event) = self.queue.pop() else {
                    break;
                };
                match event {
                    Event::Message(message) => {
                        if let Err(e) = listener.on_message(message) {
                            warn!(error = %e, "local transport listener rejected a message");
                            self.rejected.lock().push(e.to_string());
                        }
                    }
                    Event::Disconnected => listener.on_error(),
                }
            }
            self.draining.store(false, Ordering::Release);

            // Anything pushed after our last pop but before the flag cleared
            // would otherwise be stranded.
            if self.queue.is_empty() || self.current_listener().is_none() {
                return;
            }
        }
    }
}

/// One endpoint of an in-process transport pair.
pub struct LocalTransport {
    inbox: Arc<Inbox>,
    peer: Weak<Inbox>,
}

impl LocalTransport {
    /// Create two connected endpoints. Each endpoint owns its own inbox and
    /// reaches the other's weakly, so dropping one endpoint makes transmits
    /// from the other fail instead of queueing forever.
    pub fn pair() -> (Arc<LocalTransport>, Arc<LocalTransport>) {
        let a = Arc::new(Inbox::default());
        let b = Arc::new(Inbox::default());
        let first = Arc::new(LocalTransport {
            peer: Arc::downgrade(&b),
            inbox: a,
        });
        let second = Arc::new(LocalTransport {
            peer: Arc::downgrade(&first.inbox),
            inbox: b,
        });
        (first, second)
    }

    /// Messages this endpoint's listener rejected, oldest first.
    pub fn rejected_messages(&self) -> Vec<String> {
        self.inbox.rejected.lock().clone()
    }
}

impl Transport for LocalTransport {
    fn activate(&self, listener: Arc<dyn TransportListener>) -> Result<()> {
        if self.inbox.closed.load(Ordering::Acquire) {
            return Err(Error::driver("transport already deactivated"));
        }
        *self.inbox.listener.lock() = Some(listener);
        self.inbox.pump();
        Ok(())
    }

    fn deactivate(&self) {
        if self.inbox.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inbox.listener.lock().take();
        while self.inbox.queue.pop().is_some() {}
        if let Some(peer) = self.peer.upgrade() {
            if !peer.closed.load(Ordering::Acquire) {
                peer.queue.push(Event::Disconnected);
                peer.pump();
            }
        }
        trace!("local transport deactivated");
    }

    fn transmit(&self, message: TransportMessage) -> Result<()> {
        if self.inbox.closed.load(Ordering::Acquire) {
            return Err(Error::driver("transmit on deactivated transport"));
        }
        let Some(peer) = self.peer.upgrade() else {
            return Err(Error::driver("peer transport is gone"));
        };
        if peer.closed.load(Ordering::Acquire) {
            return Err(Error::driver("peer transport is closed"));
        }
        peer.queue.push(Event::Message(message));
        peer.pump();
        Ok(())
    }
}

/// Zeroed heap storage standing in for an OS shared memory object.
struct Region {
    base: NonNull<u8>,
    words: usize,
    len: usize,
}

// The region is only ever accessed through raw pointers handed out by
// mappings; synchronization is the caller's business, as with real shared
// memory.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn new(len: usize) -> Self {
        // u64 storage keeps the base 8-byte aligned for atomics.
        let words = len.div_ceil(8);
        let storage: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let raw = Box::into_raw(storage) as *mut u64 as *mut u8;
        let base = NonNull::new(raw).unwrap_or(NonNull::dangling());
        Self { base, words, len }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.words == 0 {
            return;
        }
        let slice = std::ptr::slice_from_raw_parts_mut(self.base.as_ptr() as *mut u64, self.words);
        // Safety: `slice` is exactly the allocation produced in `Region::new`.
        unsafe { drop(Box::from_raw(slice)) };
    }
}

struct LocalMemory {
    region: Arc<Region>,
}

impl SharedMemory for LocalMemory {
    fn size(&self) -> usize {
        self.region.len
    }

    fn map(&self) -> Result<Arc<dyn MemoryMapping>> {
        Ok(Arc::new(LocalMapping {
            region: Arc::clone(&self.region),
        }))
    }
}

struct LocalMapping {
    region: Arc<Region>,
}

impl MemoryMapping for LocalMapping {
    fn base(&self) -> NonNull<u8> {
        self.region.base
    }

    fn len(&self) -> usize {
        self.region.len
    }
}
