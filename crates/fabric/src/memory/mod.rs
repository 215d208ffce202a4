//! Per-link shared memory.
//!
//! Every [`NodeLink`] owns one [`NodeLinkMemory`]. Both peers map the same
//! primary buffer (`BufferId(0)`) from the moment the link exists, and each
//! side may later add buffers to grow a size class. New buffers are announced
//! to the peer over the link, after which either side can resolve and free
//! fragments in them.
//!
//! # Size classes
//!
//! A request for `n` bytes is served by a block of `ceil_pow2(max(n, 64))`
//! bytes. Requests above `max_fragment_size` are refused outright and never
//! trigger expansion.
//!
//! # Expansion
//!
//! When a class has no free block the allocation fails and at most one
//! expansion per class is started in the background. The caller retries.
//! Expansion stops for good once a class would exceed `max_class_capacity`
//! or a shared memory allocation fails.

pub mod block_allocator;
pub mod layout;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::config::{MemoryConfig, MIN_BLOCK_SIZE, PRIMARY_HEADER_SIZE};
use crate::driver::{Driver, MemoryMapping, SharedMemory};
use crate::error::{Error, Result};
use crate::fragment::{BufferId, Fragment, FragmentDescriptor};
use crate::node::Node;
use crate::node_link::NodeLink;

use block_allocator::BlockAllocator;
use layout::{PrimaryLayout, RegionLayout};

/// Invoked once an expansion attempt settles; `true` if capacity was added.
pub type CapacityCallback = Box<dyn FnOnce(bool) + Send>;

/// Invoked once a buffer becomes known locally.
pub type BufferCallback = Box<dyn FnOnce() + Send>;

struct LinkBuffer {
    mapping: Arc<dyn MemoryMapping>,
    allocators: Vec<Arc<BlockAllocator>>,
}

#[derive(Default)]
struct Expansion {
    in_flight: bool,
    exhausted: bool,
    waiters: Vec<CapacityCallback>,
}

struct SizeClass {
    allocators: RwLock<Vec<(BufferId, Arc<BlockAllocator>)>>,
    capacity: AtomicUsize,
    expansion: Mutex<Expansion>,
}

impl SizeClass {
    fn new() -> Self {
        Self {
            allocators: RwLock::new(Vec::new()),
            capacity: AtomicUsize::new(0),
            expansion: Mutex::new(Expansion::default()),
        }
    }
}

/// Shared memory coordinator for one link.
pub struct NodeLinkMemory {
    node: Weak<Node>,
    driver: Arc<dyn Driver>,
    config: MemoryConfig,
    primary: Arc<dyn MemoryMapping>,
    buffers: DashMap<BufferId, LinkBuffer>,
    classes: Vec<SizeClass>,
    buffer_waiters: Mutex<HashMap<BufferId, Vec<BufferCallback>>>,
    link: Mutex<Weak<NodeLink>>,
}

impl NodeLinkMemory {
    /// Allocate and initialize a primary buffer for a new link. The returned
    /// object is handed to both peers, which each [`adopt`](Self::adopt) it.
    pub fn allocate_primary(
        driver: &dyn Driver,
        config: &MemoryConfig,
    ) -> Result<Arc<dyn SharedMemory>> {
        config.validate()?;
        let layout = PrimaryLayout::compute(config)?;
        let memory = driver.allocate_shared_memory(config.primary_buffer_size)?;
        let mapping = memory.map()?;
        if mapping.len() < config.primary_buffer_size {
            return Err(Error::driver("primary buffer mapping is too small"));
        }
        for region in layout.regions {
            BlockAllocator::new(Arc::clone(&mapping), region)?.initialize();
        }
        primary_header(&mapping).store(1, Ordering::Release);
        Ok(memory)
    }

    /// Build a link memory around an already-initialized primary buffer.
    pub fn adopt(
        node: Weak<Node>,
        driver: Arc<dyn Driver>,
        config: MemoryConfig,
        primary: Arc<dyn SharedMemory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let layout = PrimaryLayout::compute(&config)?;
        let mapping = primary.map()?;
        if mapping.len() < config.primary_buffer_size {
            return Err(Error::invalid_argument(format!(
                "primary buffer is {} bytes, expected {}",
                mapping.len(),
                config.primary_buffer_size
            )));
        }

        let class_count =
            (config.max_fragment_size.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros() + 1) as usize;
        let classes = (0..class_count).map(|_| SizeClass::new()).collect();

        let memory = Self {
            node,
            driver,
            config,
            primary: Arc::clone(&mapping),
            buffers: DashMap::new(),
            classes,
            buffer_waiters: Mutex::new(HashMap::new()),
            link: Mutex::new(Weak::new()),
        };

        let mut allocators = Vec::with_capacity(layout.regions.len());
        for region in layout.regions {
            allocators.push(Arc::new(BlockAllocator::new(Arc::clone(&mapping), region)?));
        }
        memory.insert_buffer(BufferId::PRIMARY, mapping, allocators)?;
        Ok(Arc::new(memory))
    }

    /// Attach the link used to announce new buffers to the peer.
    pub fn set_link(&self, link: &Arc<NodeLink>) {
        *self.link.lock() = Arc::downgrade(link);
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Allocate a fragment of at least `size` bytes. Returns a null fragment
    /// if `size` is zero or too large, or if the class is out of blocks; in
    /// the last case an expansion is started and a later retry may succeed.
    pub fn allocate_fragment(self: &Arc<Self>, size: usize) -> Fragment {
        let Some(block_size) = self.config.block_size_for(size) else {
            trace!(size, "fragment request outside supported sizes");
            return Fragment::null();
        };
        let class = self.class(block_size);
        for (buffer_id, allocator) in class.allocators.read().iter() {
            if let Some(offset) = allocator.allocate() {
                counter!("fabric.fragments.allocated").increment(1);
                let descriptor = FragmentDescriptor::new(*buffer_id, offset as u32, block_size);
                trace!(?descriptor, "allocated fragment");
                return Fragment::mapped(descriptor, Arc::clone(allocator.mapping()));
            }
        }

        counter!("fabric.fragments.exhausted").increment(1);
        self.expand(block_size, None);
        Fragment::null()
    }

    /// Free `fragment`. True only if it denoted a currently allocated block.
    /// Either peer may free any fragment once both know its buffer.
    pub fn free_fragment(&self, fragment: &Fragment) -> bool {
        let descriptor = fragment.descriptor();
        if descriptor.is_null() {
            return false;
        }
        let Some(buffer) = self.buffers.get(&descriptor.buffer_id) else {
            return false;
        };
        let offset = descriptor.offset as usize;
        buffer
            .allocators
            .iter()
            .find(|a| a.block_size() == descriptor.size && a.owns(offset))
            .is_some_and(|a| a.free(offset))
    }

    /// Resolve a descriptor, typically received from the peer. The result is
    /// pending if the buffer is not yet known here, and null if the
    /// descriptor is malformed or out of bounds.
    pub fn get_fragment(&self, descriptor: FragmentDescriptor) -> Fragment {
        if descriptor.is_null() || descriptor.size == 0 {
            return Fragment::null();
        }
        let Some(buffer) = self.buffers.get(&descriptor.buffer_id) else {
            return Fragment::pending(descriptor);
        };
        match descriptor.end() {
            Some(end) if end <= buffer.mapping.len() => {
                Fragment::mapped(descriptor, Arc::clone(&buffer.mapping))
            }
            _ => Fragment::null(),
        }
    }

    /// Run `callback` once `id` is known locally; immediately if it already is.
    pub fn wait_for_buffer(&self, id: BufferId, callback: BufferCallback) {
        {
            let mut waiters = self.buffer_waiters.lock();
            if !self.buffers.contains_key(&id) {
                waiters.entry(id).or_default().push(callback);
                return;
            }
        }
        callback();
    }

    /// Ask for more capacity in the class serving `size`. `callback` learns
    /// whether capacity was added, possibly before this returns.
    pub fn request_block_capacity(self: &Arc<Self>, size: usize, callback: CapacityCallback) {
        match self.config.block_size_for(size) {
            Some(block_size) => self.expand(block_size, Some(callback)),
            None => callback(false),
        }
    }

    /// Register a buffer of `num_blocks` blocks announced by the peer, which
    /// already initialized it.
    pub fn add_block_buffer(
        &self,
        id: BufferId,
        block_size: u32,
        num_blocks: u32,
        memory: Arc<dyn SharedMemory>,
    ) -> Result<()> {
        let layout = RegionLayout::with_blocks(0, block_size, num_blocks);
        self.register_expansion_buffer(id, layout, memory, false)
    }

    /// Total block capacity, in bytes, of the class serving `size`.
    pub fn block_capacity(&self, size: usize) -> usize {
        self.config
            .block_size_for(size)
            .map_or(0, |b| self.class(b).capacity.load(Ordering::Acquire))
    }

    /// Whether the class serving `size` has stopped expanding.
    pub fn is_class_exhausted(&self, size: usize) -> bool {
        self.config
            .block_size_for(size)
            .map_or(true, |b| self.class(b).expansion.lock().exhausted)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn has_buffer(&self, id: BufferId) -> bool {
        self.buffers.contains_key(&id)
    }

    fn class(&self, block_size: u32) -> &SizeClass {
        let index = (block_size.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize;
        &self.classes[index]
    }

    fn allocate_buffer_id(&self) -> BufferId {
        BufferId(primary_header(&self.primary).fetch_add(1, Ordering::AcqRel))
    }

    fn insert_buffer(
        &self,
        id: BufferId,
        mapping: Arc<dyn MemoryMapping>,
        allocators: Vec<Arc<BlockAllocator>>,
    ) -> Result<()> {
        match self.buffers.entry(id) {
            Entry::Occupied(_) => {
                return Err(Error::precondition(format!("{id} is already registered")));
            }
            Entry::Vacant(slot) => {
                slot.insert(LinkBuffer {
                    mapping,
                    allocators: allocators.clone(),
                });
            }
        }

        for allocator in allocators {
            let class = self.class(allocator.block_size());
            class
                .capacity
                .fetch_add(allocator.layout().capacity(), Ordering::AcqRel);
            class.allocators.write().push((id, allocator));
        }

        let waiters = self.buffer_waiters.lock().remove(&id).unwrap_or_default();
        for waiter in waiters {
            waiter();
        }
        Ok(())
    }

    fn register_expansion_buffer(
        &self,
        id: BufferId,
        layout: RegionLayout,
        memory: Arc<dyn SharedMemory>,
        initialize: bool,
    ) -> Result<()> {
        let block_size = layout.block_size;
        if !block_size.is_power_of_two()
            || block_size < MIN_BLOCK_SIZE
            || block_size > self.config.max_fragment_size
        {
            return Err(Error::invalid_argument(format!(
                "unsupported block size {block_size}"
            )));
        }
        if id == BufferId::PRIMARY || id == BufferId::INVALID {
            return Err(Error::invalid_argument(format!("{id} cannot be added")));
        }
        if !layout.is_addressable() {
            return Err(Error::invalid_argument(format!(
                "{id} cannot address {} blocks of {block_size} bytes",
                layout.num_blocks
            )));
        }
        let mapping = memory.map()?;
        let allocator = BlockAllocator::new(Arc::clone(&mapping), layout)?;
        if initialize {
            allocator.initialize();
        }
        self.insert_buffer(id, mapping, vec![Arc::new(allocator)])
    }

    fn expand(self: &Arc<Self>, block_size: u32, callback: Option<CapacityCallback>) {
        let class = self.class(block_size);
        let layout = RegionLayout::for_expansion(&self.config, block_size);
        {
            let mut expansion = class.expansion.lock();
            if expansion.exhausted {
                drop(expansion);
                if let Some(callback) = callback {
                    callback(false);
                }
                return;
            }
            expansion.waiters.extend(callback);
            if expansion.in_flight {
                return;
            }
            let capacity = class.capacity.load(Ordering::Acquire);
            if capacity + layout.capacity() > self.config.max_class_capacity {
                expansion.exhausted = true;
                let waiters = std::mem::take(&mut expansion.waiters);
                drop(expansion);
                debug!(block_size, capacity, "size class reached its capacity ceiling");
                for waiter in waiters {
                    waiter(false);
                }
                return;
            }
            expansion.in_flight = true;
        }

        let buffer_size = layout.end();
        let weak = Arc::downgrade(self);
        let on_memory = move |memory: Option<Arc<dyn SharedMemory>>| {
            if let Some(this) = weak.upgrade() {
                this.complete_expansion(layout, memory);
            }
        };
        match self.node.upgrade() {
            Some(node) => node.allocate_shared_memory(buffer_size, Box::new(on_memory)),
            None => on_memory(self.driver.allocate_shared_memory(buffer_size).ok()),
        }
    }

    fn complete_expansion(&self, layout: RegionLayout, memory: Option<Arc<dyn SharedMemory>>) {
        let block_size = layout.block_size;
        let outcome = match memory {
            Some(memory) => {
                let id = self.allocate_buffer_id();
                self.register_expansion_buffer(id, layout, Arc::clone(&memory), true)
                    .map(|()| (id, memory))
            }
            None => Err(Error::driver("no shared memory for expansion")),
        };

        let added = match outcome {
            Ok((id, memory)) => {
                counter!("fabric.memory.expansions").increment(1);
                debug!(%id, block_size, "expanded link memory");
                let link = self.link.lock().upgrade();
                if let Some(link) = link {
                    if let Err(e) =
                        link.send_add_block_buffer(id, block_size, layout.num_blocks, memory)
                    {
                        warn!(error = %e, %id, "failed to share new buffer with peer");
                    }
                }
                true
            }
            Err(e) => {
                warn!(error = %e, block_size, "link memory expansion failed");
                false
            }
        };

        let waiters = {
            let class = self.class(block_size);
            let mut expansion = class.expansion.lock();
            expansion.in_flight = false;
            if !added {
                expansion.exhausted = true;
            }
            std::mem::take(&mut expansion.waiters)
        };
        for waiter in waiters {
            waiter(added);
        }
    }
}

fn primary_header(mapping: &Arc<dyn MemoryMapping>) -> &AtomicU64 {
    debug_assert!(mapping.len() >= PRIMARY_HEADER_SIZE);
    // Safety: mappings are 8-byte aligned and the header occupies the first
    // bytes of the primary buffer.
    unsafe { &*(mapping.base().as_ptr() as *const AtomicU64) }
}
