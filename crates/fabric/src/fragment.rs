//! Fragments of link memory.
//!
//! A [`FragmentDescriptor`] names a region of shared memory by buffer,
//! offset and size. It is plain data and travels freely between peers. A
//! [`Fragment`] is a descriptor resolved against a local mapping, which makes
//! it addressable.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::driver::MemoryMapping;

/// Sequential identifier of a buffer known to a link's memory.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct BufferId(pub u64);

impl BufferId {
    /// The primary buffer, shared by both peers from construction.
    pub const PRIMARY: BufferId = BufferId(0);

    /// Sentinel used by null descriptors.
    pub const INVALID: BufferId = BufferId(u64::MAX);
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Transferable description of a fragment.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct FragmentDescriptor {
    pub buffer_id: BufferId,
    pub offset: u32,
    pub size: u32,
}

impl FragmentDescriptor {
    pub const fn new(buffer_id: BufferId, offset: u32, size: u32) -> Self {
        Self {
            buffer_id,
            offset,
            size,
        }
    }

    pub const fn null() -> Self {
        Self::new(BufferId::INVALID, 0, 0)
    }

    pub fn is_null(&self) -> bool {
        self.buffer_id == BufferId::INVALID
    }

    /// One past the last byte, or `None` on overflow.
    pub fn end(&self) -> Option<usize> {
        (self.offset as usize).checked_add(self.size as usize)
    }
}

impl Default for FragmentDescriptor {
    fn default() -> Self {
        Self::null()
    }
}

/// A descriptor plus, when addressable, the mapping it lives in.
///
/// Three states exist:
/// - null: allocation failed or the descriptor was invalid;
/// - pending: the descriptor is well-formed but its buffer is not yet mapped
///   locally;
/// - addressable: the bytes can be read and written.
#[derive(Clone, Default)]
pub struct Fragment {
    descriptor: FragmentDescriptor,
    mapping: Option<Arc<dyn MemoryMapping>>,
}

impl Fragment {
    pub fn null() -> Self {
        Self::default()
    }

    pub(crate) fn pending(descriptor: FragmentDescriptor) -> Self {
        Self {
            descriptor,
            mapping: None,
        }
    }

    pub(crate) fn mapped(descriptor: FragmentDescriptor, mapping: Arc<dyn MemoryMapping>) -> Self {
        Self {
            descriptor,
            mapping: Some(mapping),
        }
    }

    pub fn is_null(&self) -> bool {
        self.descriptor.is_null()
    }

    pub fn is_pending(&self) -> bool {
        !self.is_null() && self.mapping.is_none()
    }

    pub fn is_addressable(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn descriptor(&self) -> FragmentDescriptor {
        self.descriptor
    }

    pub fn buffer_id(&self) -> BufferId {
        self.descriptor.buffer_id
    }

    pub fn offset(&self) -> u32 {
        self.descriptor.offset
    }

    pub fn size(&self) -> u32 {
        self.descriptor.size
    }

    /// Address of the first byte, if addressable.
    pub fn address(&self) -> Option<NonNull<u8>> {
        let mapping = self.mapping.as_ref()?;
        // Safety: the descriptor was bounds-checked against this mapping when
        // the fragment was resolved.
        let ptr = unsafe { mapping.base().as_ptr().add(self.descriptor.offset as usize) };
        NonNull::new(ptr)
    }

    /// Copy `data` into the fragment starting at `at`. Returns false if the
    /// fragment is not addressable or the write would overrun it.
    pub fn write_bytes(&self, at: usize, data: &[u8]) -> bool {
        let Some(addr) = self.address() else {
            return false;
        };
        match at.checked_add(data.len()) {
            Some(end) if end <= self.size() as usize => {}
            _ => return false,
        }
        // Safety: bounds checked above; the region is shared memory so
        // concurrent writers are the caller's responsibility.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), addr.as_ptr().add(at), data.len());
        }
        true
    }

    /// Copy the fragment's bytes out, or `None` if not addressable.
    pub fn read_bytes(&self) -> Option<Vec<u8>> {
        let addr = self.address()?;
        let mut out = vec![0u8; self.size() as usize];
        // Safety: the fragment spans `size` mapped bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(addr.as_ptr(), out.as_mut_ptr(), out.len());
        }
        Some(out)
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fragment")
            .field("descriptor", &self.descriptor)
            .field("addressable", &self.is_addressable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_fragment() {
        let fragment = Fragment::null();
        assert!(fragment.is_null());
        assert!(!fragment.is_pending());
        assert!(!fragment.is_addressable());
        assert!(fragment.address().is_none());
        assert!(fragment.read_bytes().is_none());
    }

    #[test]
    fn test_pending_fragment() {
        let fragment = Fragment::pending(FragmentDescriptor::new(BufferId(3), 128, 64));
        assert!(!fragment.is_null());
        assert!(fragment.is_pending());
        assert!(!fragment.write_bytes(0, b"x"));
    }

    #[test]
    fn test_descriptor_is_transferable() {
        let descriptor = FragmentDescriptor::new(BufferId(7), 4096, 256);
        let bytes = bincode::serialize(&descriptor).unwrap();
        let decoded: FragmentDescriptor = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, descriptor);
        assert_eq!(descriptor.end(), Some(4352));
    }
}
