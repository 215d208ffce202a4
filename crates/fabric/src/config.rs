//! Tunables for nodes and link memory.
//!
//! Defaults are what every test and the CLI use. Both peers of a link must
//! agree on [`MemoryConfig`], since the primary buffer layout is derived from
//! it rather than transmitted.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::layout::PrimaryLayout;

/// Smallest block any fragment occupies.
pub const MIN_BLOCK_SIZE: u32 = 64;

/// Bytes reserved at the start of the primary buffer for shared link state.
pub const PRIMARY_HEADER_SIZE: usize = 64;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// A block region carved out of the primary buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryClass {
    pub block_size: u32,
    pub region_size: usize,
}

impl PrimaryClass {
    pub const fn new(block_size: u32, region_size: usize) -> Self {
        Self {
            block_size,
            region_size,
        }
    }
}

/// Link memory configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Size of `BufferId(0)`.
    pub primary_buffer_size: usize,
    /// Block regions in the primary buffer, laid out in order.
    pub primary_classes: Vec<PrimaryClass>,
    /// Target size of each buffer added by capacity expansion.
    pub expansion_buffer_size: usize,
    /// A size class stops expanding once its capacity would exceed this.
    pub max_class_capacity: usize,
    /// Largest fragment that can be allocated; must be a power of two.
    pub max_fragment_size: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            primary_buffer_size: 64 * 1024,
            primary_classes: vec![
                PrimaryClass::new(64, 8 * 1024),
                PrimaryClass::new(256, 8 * 1024),
                PrimaryClass::new(512, 8 * 1024),
                PrimaryClass::new(1024, 8 * 1024),
                PrimaryClass::new(2048, 16 * 1024),
            ],
            expansion_buffer_size: 256 * 1024,
            max_class_capacity: 32 * 1024 * 1024,
            max_fragment_size: 16 * 1024 * 1024,
        }
    }
}

impl MemoryConfig {
    #[must_use]
    pub fn with_primary_buffer_size(mut self, size: usize) -> Self {
        self.primary_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_primary_classes(mut self, classes: Vec<PrimaryClass>) -> Self {
        self.primary_classes = classes;
        self
    }

    #[must_use]
    pub fn with_expansion_buffer_size(mut self, size: usize) -> Self {
        self.expansion_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_max_class_capacity(mut self, capacity: usize) -> Self {
        self.max_class_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_max_fragment_size(mut self, size: u32) -> Self {
        self.max_fragment_size = size;
        self
    }

    /// Block size serving a request of `size` bytes: the next power of two,
    /// at least [`MIN_BLOCK_SIZE`]. `None` for zero or oversized requests.
    pub fn block_size_for(&self, size: usize) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let block = size
            .max(MIN_BLOCK_SIZE as usize)
            .checked_next_power_of_two()?;
        if block > self.max_fragment_size as usize {
            return None;
        }
        u32::try_from(block).ok()
    }

    /// Check that the configuration is self-consistent.
    pub fn validate(&self) -> Result<()> {
        if !self.max_fragment_size.is_power_of_two() || self.max_fragment_size < MIN_BLOCK_SIZE {
            return Err(Error::InvalidLayout(format!(
                "max_fragment_size {} must be a power of two >= {}",
                self.max_fragment_size, MIN_BLOCK_SIZE
            )));
        }
        if self.expansion_buffer_size == 0 {
            return Err(Error::InvalidLayout("expansion_buffer_size is zero".into()));
        }
        // Fragment offsets are 32-bit.
        if self.expansion_buffer_size > u32::MAX as usize {
            return Err(Error::InvalidLayout(format!(
                "expansion_buffer_size {} exceeds {}",
                self.expansion_buffer_size,
                u32::MAX
            )));
        }
        PrimaryLayout::compute(self).map(|_| ())
    }

    pub fn link_layout(&self) -> LinkLayout {
        LinkLayout {
            primary_buffer_size: self.primary_buffer_size,
            primary_classes: self.primary_classes.clone(),
            max_fragment_size: self.max_fragment_size,
        }
    }

    /// Fails unless the peer's `remote` layout is the one we would build.
    pub fn check_link_layout(&self, remote: &LinkLayout) -> Result<()> {
        if self.link_layout() == *remote {
            return Ok(());
        }
        Err(Error::InvalidLayout(format!(
            "peer lays out a {} byte primary buffer with {} classes up to {} bytes; \
             ours is {} bytes with {} classes up to {} bytes",
            remote.primary_buffer_size,
            remote.primary_classes.len(),
            remote.max_fragment_size,
            self.primary_buffer_size,
            self.primary_classes.len(),
            self.max_fragment_size,
        )))
    }
}

/// The part of a [`MemoryConfig`] that places allocator state inside the
/// primary buffer. Peers exchange it while setting up a link and refuse the
/// link unless it matches their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkLayout {
    pub primary_buffer_size: usize,
    pub primary_classes: Vec<PrimaryClass>,
    pub max_fragment_size: u32,
}

/// Node-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub memory: MemoryConfig,
    pub protocol_version: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl NodeConfig {
    #[must_use]
    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    #[must_use]
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MemoryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_block_size_rules() {
        let config = MemoryConfig::default();
        assert_eq!(config.block_size_for(0), None);
        assert_eq!(config.block_size_for(1), Some(64));
        assert_eq!(config.block_size_for(63), Some(64));
        assert_eq!(config.block_size_for(64), Some(64));
        assert_eq!(config.block_size_for(65), Some(128));
        assert_eq!(config.block_size_for(250), Some(256));
        assert_eq!(config.block_size_for(16 * 1024 * 1024), Some(16 * 1024 * 1024));
        assert_eq!(config.block_size_for(64 * 1024 * 1024), None);
        assert_eq!(config.block_size_for(usize::MAX), None);
    }

    #[test]
    fn test_overflowing_primary_layout_is_rejected() {
        let config = MemoryConfig::default().with_primary_buffer_size(16 * 1024);
        assert!(matches!(config.validate(), Err(Error::InvalidLayout(_))));
    }

    #[test]
    fn test_expansion_buffer_must_fit_fragment_offsets() {
        let config = MemoryConfig::default().with_expansion_buffer_size(u32::MAX as usize + 1);
        assert!(matches!(config.validate(), Err(Error::InvalidLayout(_))));
        let config: MemoryConfig =
            serde_json::from_str(r#"{ "expansion_buffer_size": 8589934592 }"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_link_layout_ignores_local_tunables() {
        let ours = MemoryConfig::default();
        let theirs = MemoryConfig::default()
            .with_expansion_buffer_size(4096)
            .with_max_class_capacity(1024 * 1024);
        assert!(ours.check_link_layout(&theirs.link_layout()).is_ok());

        let theirs = MemoryConfig::default()
            .with_primary_classes(vec![PrimaryClass::new(64, 32 * 1024)]);
        assert!(matches!(
            ours.check_link_layout(&theirs.link_layout()),
            Err(Error::InvalidLayout(_))
        ));
        let theirs = MemoryConfig::default().with_max_fragment_size(1024 * 1024);
        assert!(ours.check_link_layout(&theirs.link_layout()).is_err());
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{ "memory": { "max_class_capacity": 1048576 } }"#).unwrap();
        assert_eq!(config.memory.max_class_capacity, 1024 * 1024);
        assert_eq!(config.memory.primary_buffer_size, 64 * 1024);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
    }

    proptest! {
        #[test]
        fn prop_small_sizes_use_min_block(size in 1usize..64) {
            prop_assert_eq!(MemoryConfig::default().block_size_for(size), Some(64));
        }

        #[test]
        fn prop_block_is_smallest_covering_power_of_two(size in 65usize..=(16 * 1024 * 1024)) {
            let block = MemoryConfig::default().block_size_for(size).unwrap() as usize;
            prop_assert!(block.is_power_of_two());
            prop_assert!(block >= size);
            prop_assert!(block / 2 < size);
        }
    }
}
