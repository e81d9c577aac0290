pub(crate) mod export;
pub mod manager;
pub(crate) mod vm;

use crate::driver::{MemoryId, ShareableBuffer};
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::Arc;

/// Parameters for one map request on the shim's upstream surface.
pub struct MapInfo {
    /// Allocation to map.
    pub memory: MemoryId,
    /// Byte offset into the allocation the returned pointer addresses.
    pub offset: u64,
    /// Length to map; `None` maps the whole allocation.
    pub size: Option<u64>,
    /// Caller-chosen virtual address for the mapping base. When absent the
    /// request goes to the driver's native map path untouched.
    pub placed_address: Option<NonNull<u8>>,
}

/// The shareable storage behind an instrumented allocation.
///
/// At most one variant is ever populated for a given allocation; release is
/// dispatched once per variant when the record drops (descriptor close,
/// buffer reference drop).
pub(crate) enum BackingHandle {
    None,
    Fd(OwnedFd),
    Buffer(Arc<dyn ShareableBuffer>),
}

/// Shim-private state for one instrumented allocation.
///
/// The registry exclusively owns the record; the record exclusively owns its
/// backing handle and its active placed mapping.
pub(crate) struct MemoryRecord {
    /// Requested allocation size at creation time.
    pub size: u64,
    pub backing: BackingHandle,
    /// Base address of the active placed mapping. `None` exactly when
    /// `map_len == 0`.
    pub map_addr: Option<NonNull<u8>>,
    pub map_len: usize,
}

// SAFETY: map_addr is only a remembered address; the record never
// dereferences it and the mapping itself is process-global.
unsafe impl Send for MemoryRecord {}

impl MemoryRecord {
    pub fn new(size: u64, backing: BackingHandle) -> Self {
        Self {
            size,
            backing,
            map_addr: None,
            map_len: 0,
        }
    }

    pub fn active_mapping(&self) -> Option<(NonNull<u8>, usize)> {
        self.map_addr.map(|addr| (addr, self.map_len))
    }

    pub fn set_mapping(&mut self, addr: NonNull<u8>, len: usize) {
        self.map_addr = Some(addr);
        self.map_len = len;
    }

    pub fn clear_mapping(&mut self) {
        self.map_addr = None;
        self.map_len = 0;
    }
}

// Re-export the entry-point type for easy access
pub use manager::MemoryShim;
