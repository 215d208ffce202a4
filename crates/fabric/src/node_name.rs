//! Node identity.
//!
//! Nodes are identified by a compact 128-bit [`NodeName`] that is cheap to
//! compare, hash and copy. Names are minted by an [`IdentityAuthority`]
//! injected into the broker; normal nodes receive theirs during the
//! handshake.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::driver::Driver;

/// Globally unique identity of a node.
///
/// Two `u64` halves rather than a `u128` so the serialized form is stable
/// across bincode configurations.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct NodeName {
    high: u64,
    low: u64,
}

impl NodeName {
    /// Construct a name from its two halves.
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Construct a name from 16 raw bytes (big-endian halves).
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut high = [0u8; 8];
        let mut low = [0u8; 8];
        high.copy_from_slice(&bytes[..8]);
        low.copy_from_slice(&bytes[8..]);
        Self {
            high: u64::from_be_bytes(high),
            low: u64::from_be_bytes(low),
        }
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    pub fn low(&self) -> u64 {
        self.low
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

/// Source of fresh node names.
///
/// Brokers consult their authority once for their own name and once per
/// normal node that connects to them.
pub trait IdentityAuthority: Send + Sync + 'static {
    /// Mint a name that has never been handed out before.
    fn generate_name(&self) -> NodeName;
}

/// Authority drawing 128 random bits from the driver for every name.
pub struct RandomNameAuthority {
    driver: Arc<dyn Driver>,
}

impl RandomNameAuthority {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }
}

impl IdentityAuthority for RandomNameAuthority {
    fn generate_name(&self) -> NodeName {
        let mut bytes = [0u8; 16];
        self.driver.generate_random_bytes(&mut bytes);
        NodeName::from_bytes(bytes)
    }
}
