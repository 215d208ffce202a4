//! Reporting of misbehaving peers.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::node_link::NodeLink;

/// Gatekeeper bound to the link a message arrived on.
///
/// Holds only a weak reference: once the link is dropped, or the validator
/// is closed, rejections fail instead of reaching the driver.
pub struct Validator {
    remote_source: Mutex<Option<Weak<NodeLink>>>,
}

impl Validator {
    pub fn new(link: &Arc<NodeLink>) -> Self {
        Self {
            remote_source: Mutex::new(Some(Arc::downgrade(link))),
        }
    }

    /// Report `context` as bad activity on the bound link's transport.
    pub fn reject(&self, context: &str) -> Result<()> {
        let link = self
            .remote_source
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::precondition("validator has no live link"))?;
        link.report_bad_activity(context);
        Ok(())
    }

    pub fn close(&self) {
        self.remote_source.lock().take();
    }
}
