//! Initial portal slots handed to [`Node::connect_node`](crate::Node::connect_node).
//!
//! Routing over portals belongs to a higher layer. The fabric only binds
//! each slot to the link that the connection produced.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::node_name::NodeName;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PortalState {
    /// The connection has not completed yet.
    #[default]
    Pending,
    /// Bound to sublink `sublink` of the link to `remote`.
    Bound { remote: NodeName, sublink: u64 },
    /// The peer offered fewer portals, or the connection failed.
    Closed,
}

/// Caller-allocated portal slot. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct PortalHandle {
    state: Arc<Mutex<PortalState>>,
}

impl PortalHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `count` fresh slots.
    pub fn batch(count: usize) -> Vec<Self> {
        (0..count).map(|_| Self::new()).collect()
    }

    pub fn state(&self) -> PortalState {
        *self.state.lock()
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.state(), PortalState::Bound { .. })
    }

    /// Bind a pending slot. Settled slots are left alone.
    pub(crate) fn bind(&self, remote: NodeName, sublink: u64) -> bool {
        let mut state = self.state.lock();
        if *state != PortalState::Pending {
            return false;
        }
        *state = PortalState::Bound { remote, sublink };
        true
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        if *state == PortalState::Pending {
            *state = PortalState::Closed;
        }
    }
}

/// Bind the first `usable` portals to `remote` in order and close the rest.
pub(crate) fn bind_initial_portals(portals: &[PortalHandle], remote: NodeName, usable: usize) {
    for (index, portal) in portals.iter().enumerate() {
        if index < usable {
            portal.bind(remote, index as u64);
        } else {
            portal.close();
        }
    }
}
