//! Lock-free fixed-size block allocator living inside shared memory.
//!
//! All allocator state sits in the region's metadata words, so both peers
//! mapping the same buffer operate on one allocator without any
//! process-local bookkeeping: a block allocated on one side can be freed on
//! the other.
//!
//! The free list is a tagged Treiber stack. The head word packs a 32-bit
//! ABA tag above a 32-bit link; a link is `index + 1`, zero ends the list.
//! Every block owns a state word holding either its free-list link,
//! [`ALLOCATED`], or [`FREEING`] while a free is being published.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::driver::MemoryMapping;
use crate::error::{Error, Result};
use crate::memory::layout::{RegionLayout, HEAD_SIZE, STATE_SIZE};

const END_OF_LIST: u32 = 0;
const ALLOCATED: u32 = u32::MAX;
const FREEING: u32 = u32::MAX - 1;

fn pack(tag: u32, link: u32) -> u64 {
    ((tag as u64) << 32) | link as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

pub(crate) struct BlockAllocator {
    mapping: Arc<dyn MemoryMapping>,
    layout: RegionLayout,
}

impl BlockAllocator {
    /// Bind an allocator to `layout` within `mapping`. The metadata is not
    /// touched; call [`initialize`](Self::initialize) on fresh memory.
    pub fn new(mapping: Arc<dyn MemoryMapping>, layout: RegionLayout) -> Result<Self> {
        if layout.end() > mapping.len() {
            return Err(Error::InvalidLayout(format!(
                "region ends at {} but mapping is {} bytes",
                layout.end(),
                mapping.len()
            )));
        }
        let base = mapping.base().as_ptr() as usize;
        if (base + layout.metadata_offset()) % HEAD_SIZE != 0 {
            return Err(Error::InvalidLayout("misaligned allocator metadata".into()));
        }
        Ok(Self { mapping, layout })
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn mapping(&self) -> &Arc<dyn MemoryMapping> {
        &self.mapping
    }

    pub fn block_size(&self) -> u32 {
        self.layout.block_size
    }

    fn head(&self) -> &AtomicU64 {
        // Safety: alignment and bounds were checked in `new`, and the mapping
        // outlives `self`.
        unsafe {
            let ptr = self.mapping.base().as_ptr().add(self.layout.metadata_offset());
            &*(ptr as *const AtomicU64)
        }
    }

    fn state(&self, index: u32) -> &AtomicU32 {
        debug_assert!(index < self.layout.num_blocks);
        // Safety: as for `head`; state words follow it at 4-byte stride.
        unsafe {
            let offset = self.layout.metadata_offset() + HEAD_SIZE + STATE_SIZE * index as usize;
            let ptr = self.mapping.base().as_ptr().add(offset);
            &*(ptr as *const AtomicU32)
        }
    }

    /// Thread every block onto the free list. Only the creator of a buffer
    /// does this, before the buffer is shared.
    pub fn initialize(&self) {
        let n = self.layout.num_blocks;
        for index in 0..n {
            let next = if index + 1 < n { index + 2 } else { END_OF_LIST };
            self.state(index).store(next, Ordering::Relaxed);
        }
        self.head().store(pack(0, 1), Ordering::Release);
    }

    /// Pop a free block, returning its offset within the buffer.
    pub fn allocate(&self) -> Option<usize> {
        let head = self.head();
        let mut current = head.load(Ordering::Acquire);
        loop {
            let (tag, top) = unpack(current);
            if top == END_OF_LIST {
                return None;
            }
            let index = top - 1;
            if index >= self.layout.num_blocks {
                // Metadata is shared with the peer; refuse to follow a
                // corrupt link.
                return None;
            }
            let next = self.state(index).load(Ordering::Acquire);
            if next >= FREEING {
                // Popped by someone else since we read the head.
                std::hint::spin_loop();
                current = head.load(Ordering::Acquire);
                continue;
            }
            match head.compare_exchange_weak(
                current,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.state(index).store(ALLOCATED, Ordering::Release);
                    return Some(self.layout.block_offset(index));
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Return the block at `offset` to the free list. False unless the
    /// offset names a block that is currently allocated.
    pub fn free(&self, offset: usize) -> bool {
        let Some(index) = self.layout.block_index(offset) else {
            return false;
        };
        if self
            .state(index)
            .compare_exchange(ALLOCATED, FREEING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let head = self.head();
        let mut current = head.load(Ordering::Acquire);
        loop {
            let (tag, top) = unpack(current);
            self.state(index).store(top, Ordering::Release);
            match head.compare_exchange_weak(
                current,
                pack(tag.wrapping_add(1), index + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether `offset` falls inside this allocator's blocks.
    pub fn owns(&self, offset: usize) -> bool {
        offset >= self.layout.offset && offset < self.layout.blocks_end()
    }
}
