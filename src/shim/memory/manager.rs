#![allow(clippy::cast_possible_truncation)]

//! Allocation lifecycle and placed-mapping entry points.
//!
//! [`MemoryShim`] mirrors the driver's allocate/map/unmap/free surface.
//! Requests it has no business with are forwarded untouched; host-visible
//! allocations in a placed-mapping session are instrumented with a registry
//! record so later placed maps can be served directly from the allocation's
//! shareable backing.
//!
//! The shim adds no locking of its own. Callers follow the same discipline
//! the driver already imposes: operations on different allocations may run
//! concurrently, operations on the same allocation id must be serialized.

use crate::driver::{AllocateInfo, DeviceCaps, DeviceDriver, MemoryId, ShareableBuffer};
use crate::error::{ShimError, ShimResult};
use crate::shim::memory::export::{self, BackingPlan};
use crate::shim::memory::{BackingHandle, MapInfo, MemoryRecord, vm};
use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd};
use std::ptr::NonNull;
use tracing::warn;

pub struct MemoryShim<D: DeviceDriver> {
    driver: D,
    caps: DeviceCaps,

    // Shim-private state per instrumented allocation, keyed by driver id
    records: HashMap<MemoryId, MemoryRecord>,
}

impl<D: DeviceDriver> MemoryShim<D> {
    /// Wraps `driver` with the session capabilities the host environment
    /// negotiated.
    pub fn new(driver: D, caps: DeviceCaps) -> Self {
        Self {
            driver,
            caps,
            records: HashMap::new(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Whether the shim tracks extra state for this allocation.
    #[must_use]
    pub fn is_instrumented(&self, memory: MemoryId) -> bool {
        self.records.contains_key(&memory)
    }

    /// Allocate device memory, upgrading the request so a shareable backing
    /// handle exists whenever a later placed map could need one.
    ///
    /// # Errors
    /// `OutOfHostMemory` when record bookkeeping cannot be allocated,
    /// `Driver` for an underlying allocate or export-retrieval failure.
    pub fn allocate_memory(&mut self, info: &AllocateInfo<'_>) -> ShimResult<MemoryId> {
        // Nothing to instrument: forward verbatim.
        if !self.caps.placed_mapping || !self.caps.is_host_visible(info.memory_type) {
            return Ok(self.driver.allocate_memory(info)?);
        }

        self.records
            .try_reserve(1)
            .map_err(|_| ShimError::OutOfHostMemory)?;

        let (backing, synthesized) = match export::plan(info, &self.caps)? {
            BackingPlan::Acquired(backing) => (backing, None),
            BackingPlan::Synthesize(kind) => (BackingHandle::None, Some(kind)),
            BackingPlan::Detached => (BackingHandle::None, None),
        };

        let allocated = if let Some(kind) = synthesized {
            let mut augmented = info.clone();
            augmented.export = Some(kind);
            self.driver.allocate_memory(&augmented)
        } else {
            self.driver.allocate_memory(info)
        };
        // On failure the `?` drops `backing`, closing the duplicated
        // descriptor or releasing the buffer hold.
        let memory = allocated?;

        let mut record = MemoryRecord::new(info.size, backing);

        if let Some(kind) = synthesized {
            match export::retrieve(&self.driver, memory, kind) {
                Ok(handle) => record.backing = handle,
                Err(err) => {
                    // Never leave a partial record registered: release the
                    // driver allocation before propagating.
                    self.driver.free_memory(memory);
                    return Err(ShimError::Driver(err));
                }
            }
        }

        self.records.insert(memory, record);
        Ok(memory)
    }

    /// Free an allocation, tearing down whatever the shim still holds for
    /// it: the active placed mapping, then the backing handle, then the
    /// record. The driver's free runs afterwards in every case: it owns
    /// the allocation object itself regardless of instrumentation.
    pub fn free_memory(&mut self, memory: MemoryId) {
        if !memory.is_null() {
            if let Some(record) = self.records.remove(&memory) {
                if let Some((base, len)) = record.active_mapping() {
                    vm::unmap(base, len);
                }
                // Dropping the record releases the backing handle
            }
        }
        self.driver.free_memory(memory);
    }

    /// Map an allocation, serving the request directly from the shareable
    /// backing when a placed address was asked for.
    ///
    /// # Errors
    /// `MapFailed` on a placed-address conflict with an active mapping, an
    /// unmappable backing source, or a failed fixed-address mapping;
    /// `Driver` when the native fallback path fails.
    pub fn map_memory(&mut self, info: &MapInfo) -> ShimResult<NonNull<u8>> {
        let record = if info.memory.is_null() {
            None
        } else {
            self.records.get_mut(&info.memory)
        };

        let (Some(placed), Some(record)) = (info.placed_address, record) else {
            return Ok(self.driver.map_memory(info.memory, info.offset, info.size)?);
        };

        if let Some((base, _)) = record.active_mapping() {
            // The placed address is immutable for the life of a mapping;
            // re-mapping at the same base is an idempotent success.
            if base != placed {
                return Err(ShimError::MapFailed);
            }
            return Ok(offset_ptr(base, info.offset));
        }

        let source = match &record.backing {
            BackingHandle::Fd(fd) => fd.as_fd(),
            BackingHandle::Buffer(buffer) => {
                match find_region(buffer.as_ref(), record.size) {
                    Some(fd) => fd,
                    None => {
                        warn!("no buffer region covers the allocation size");
                        return Err(ShimError::MapFailed);
                    }
                }
            }
            BackingHandle::None => {
                warn!("placed map on an allocation with no shareable backing");
                return Err(ShimError::MapFailed);
            }
        };

        let map_len = match info.size {
            Some(size) => size as usize,
            None if record.size > 0 => record.size as usize,
            None => vm::region_len(source).map_err(|_| ShimError::MapFailed)? as usize,
        };

        let base = match vm::map_fixed_rw(placed, map_len, source) {
            Ok(base) => base,
            Err(err) => {
                warn!("placed mmap failed: {err}");
                return Err(ShimError::MapFailed);
            }
        };

        record.set_mapping(base, map_len);
        Ok(offset_ptr(base, info.offset))
    }

    /// Release a mapping. Reservation failures are only observable through
    /// [`unmap_memory2`](Self::unmap_memory2); this surface is void.
    pub fn unmap_memory(&mut self, memory: MemoryId) {
        let _ = self.unmap_memory2(memory, false);
    }

    /// Release a mapping, optionally leaving the virtual address range
    /// reserved: occupied and inaccessible rather than returned to the OS.
    ///
    /// # Errors
    /// `MapFailed` when the reservation cannot be installed. The original
    /// mapping is gone once installation has been attempted.
    pub fn unmap_memory2(&mut self, memory: MemoryId, reserve: bool) -> ShimResult<()> {
        let record = if memory.is_null() {
            None
        } else {
            self.records.get_mut(&memory)
        };

        let Some((record, (base, len))) =
            record.and_then(|r| r.active_mapping().map(|m| (r, m)))
        else {
            // Not ours to release
            self.driver.unmap_memory(memory);
            return Ok(());
        };

        if reserve {
            let installed = vm::reserve_fixed(base, len);
            record.clear_mapping();
            if let Err(err) = installed {
                warn!("failed to replace mapping with a reservation: {err}");
                return Err(ShimError::MapFailed);
            }
        } else {
            vm::unmap(base, len);
            record.clear_mapping();
        }

        // The driver releases its own mapping bookkeeping even though the
        // shim owned the actual memory mapping.
        self.driver.unmap_memory(memory);
        Ok(())
    }
}

fn offset_ptr(base: NonNull<u8>, offset: u64) -> NonNull<u8> {
    // SAFETY: the upstream contract keeps offset within the mapped range
    unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) }
}

/// First constituent region whose end-of-region offset covers `min_size`.
fn find_region(buffer: &dyn ShareableBuffer, min_size: u64) -> Option<BorrowedFd<'_>> {
    buffer
        .region_fds()
        .into_iter()
        .find(|fd| vm::region_len(*fd).is_ok_and(|len| len >= min_size))
}
