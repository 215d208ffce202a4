//! Deterministic placement of block regions inside link buffers.
//!
//! Both peers derive the primary layout from the same checked
//! [`LinkLayout`](crate::config::LinkLayout); expansion regions travel as a
//! block count. A region is `num_blocks` blocks at block-aligned
//! offsets followed by the allocator metadata: one 64-bit free-list head and
//! one 32-bit state word per block.

use crate::config::{MemoryConfig, MIN_BLOCK_SIZE, PRIMARY_HEADER_SIZE};
use crate::error::{Error, Result};

pub(crate) const HEAD_SIZE: usize = 8;
pub(crate) const STATE_SIZE: usize = 4;

/// State words reserve their top two values as markers.
const MAX_BLOCKS_PER_REGION: usize = (u32::MAX - 2) as usize;

/// Placement of one block region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub offset: usize,
    pub block_size: u32,
    pub num_blocks: u32,
}

impl RegionLayout {
    /// Largest region of `block_size` blocks fitting in `region_size` bytes
    /// at `offset`, or `None` if not even one block fits.
    pub fn fit(offset: usize, region_size: usize, block_size: u32) -> Option<Self> {
        let per_block = block_size as usize + STATE_SIZE;
        let n = region_size.checked_sub(HEAD_SIZE)? / per_block;
        if n == 0 {
            return None;
        }
        Some(Self {
            offset,
            block_size,
            num_blocks: n.min(MAX_BLOCKS_PER_REGION) as u32,
        })
    }

    /// Region holding exactly `num_blocks` blocks at `offset`.
    pub fn with_blocks(offset: usize, block_size: u32, num_blocks: u32) -> Self {
        Self {
            offset,
            block_size,
            num_blocks,
        }
    }

    /// Region used by an expansion buffer for `block_size` blocks.
    pub fn for_expansion(config: &MemoryConfig, block_size: u32) -> Self {
        let n = (config.expansion_buffer_size / block_size as usize).clamp(1, MAX_BLOCKS_PER_REGION);
        Self::with_blocks(0, block_size, n as u32)
    }

    /// At least one block, every block indexable by a state word, and every
    /// block offset representable in a fragment descriptor.
    pub fn is_addressable(&self) -> bool {
        self.num_blocks >= 1
            && self.num_blocks as usize <= MAX_BLOCKS_PER_REGION
            && self.blocks_end() <= u32::MAX as usize
    }

    pub fn blocks_end(&self) -> usize {
        self.offset + self.num_blocks as usize * self.block_size as usize
    }

    pub fn metadata_offset(&self) -> usize {
        self.blocks_end()
    }

    /// One past the last metadata byte.
    pub fn end(&self) -> usize {
        self.metadata_offset() + HEAD_SIZE + STATE_SIZE * self.num_blocks as usize
    }

    /// Bytes spanned by the whole region.
    pub fn size(&self) -> usize {
        self.end() - self.offset
    }

    /// Total bytes of block capacity.
    pub fn capacity(&self) -> usize {
        self.num_blocks as usize * self.block_size as usize
    }

    /// Index of the block starting exactly at `offset`.
    pub fn block_index(&self, offset: usize) -> Option<u32> {
        if offset < self.offset || offset >= self.blocks_end() {
            return None;
        }
        let rel = offset - self.offset;
        if rel % self.block_size as usize != 0 {
            return None;
        }
        Some((rel / self.block_size as usize) as u32)
    }

    pub fn block_offset(&self, index: u32) -> usize {
        self.offset + index as usize * self.block_size as usize
    }
}

/// Layout of the primary buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryLayout {
    pub regions: Vec<RegionLayout>,
}

impl PrimaryLayout {
    pub fn compute(config: &MemoryConfig) -> Result<Self> {
        let mut regions: Vec<RegionLayout> = Vec::with_capacity(config.primary_classes.len());
        let mut cursor = PRIMARY_HEADER_SIZE;
        for class in &config.primary_classes {
            let block_size = class.block_size;
            if !block_size.is_power_of_two()
                || block_size < MIN_BLOCK_SIZE
                || block_size > config.max_fragment_size
            {
                return Err(Error::InvalidLayout(format!(
                    "primary block size {block_size} is not a supported size class"
                )));
            }
            if regions.iter().any(|r| r.block_size == block_size) {
                return Err(Error::InvalidLayout(format!(
                    "primary block size {block_size} listed twice"
                )));
            }
            let start = cursor.next_multiple_of(block_size as usize);
            let region = RegionLayout::fit(start, class.region_size, block_size).ok_or_else(|| {
                Error::InvalidLayout(format!(
                    "primary region of {} bytes cannot hold a {block_size}-byte block",
                    class.region_size
                ))
            })?;
            let end = start + class.region_size;
            if end > config.primary_buffer_size || end > u32::MAX as usize {
                return Err(Error::InvalidLayout(format!(
                    "primary regions need {end} bytes but the buffer has {}",
                    config.primary_buffer_size
                )));
            }
            regions.push(region);
            cursor = end;
        }
        Ok(Self { regions })
    }
}
