#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

//! A self-contained software driver backed by memfd regions.
//!
//! Every allocation is an anonymous file created with `memfd_create`, so the
//! full driver contract (including fd export and platform-buffer export)
//! works without any device hardware. The examples and the test suite run
//! against this implementation.

use crate::driver::{AllocateInfo, DeviceDriver, ImportSource, MemoryId, ShareableBuffer};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// A platform buffer with a single memfd-backed region.
pub struct MemfdBuffer {
    fd: OwnedFd,
}

impl ShareableBuffer for MemfdBuffer {
    fn region_fds(&self) -> Vec<BorrowedFd<'_>> {
        vec![self.fd.as_fd()]
    }
}

struct Slot {
    fd: OwnedFd,
    size: u64,
    // Driver-chosen mapping from the native map path: (address, length)
    native_map: Option<(usize, usize)>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    slots: HashMap<u64, Slot>,
}

/// Software implementation of [`DeviceDriver`] over memfd regions.
pub struct MemfdDriver {
    state: Mutex<State>,
}

impl MemfdDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Number of live allocations, for diagnostics.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    fn create_region(size: u64) -> io::Result<OwnedFd> {
        let raw = unsafe { libc::memfd_create(c"memshim-region".as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let ret = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    fn lookup_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, "unknown memory id")
    }
}

impl Default for MemfdDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for MemfdDriver {
    fn allocate_memory(&self, info: &AllocateInfo<'_>) -> io::Result<MemoryId> {
        // An import adopts the caller's storage; otherwise fresh backing is
        // created. Export requests need no special path here because memfd
        // regions are always shareable.
        let fd = match &info.import {
            Some(ImportSource::Fd(fd)) => fd.try_clone_to_owned()?,
            Some(ImportSource::Buffer(buffer)) => {
                let regions = fd_regions_or_err(buffer.as_ref())?;
                regions[0].try_clone_to_owned()?
            }
            None => Self::create_region(info.size)?,
        };

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.slots.insert(
            id,
            Slot {
                fd,
                size: info.size,
                native_map: None,
            },
        );
        Ok(MemoryId(id))
    }

    fn free_memory(&self, memory: MemoryId) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.remove(&memory.0) {
            if let Some((addr, len)) = slot.native_map {
                unsafe {
                    libc::munmap(addr as *mut libc::c_void, len);
                }
            }
        }
    }

    fn map_memory(
        &self,
        memory: MemoryId,
        offset: u64,
        size: Option<u64>,
    ) -> io::Result<NonNull<u8>> {
        let mut state = self.state.lock().unwrap();
        let slot = state.slots.get_mut(&memory.0).ok_or_else(Self::lookup_error)?;

        if slot.native_map.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "memory is already mapped",
            ));
        }

        let len = size.unwrap_or(slot.size.saturating_sub(offset)) as usize;
        let ret = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                slot.fd.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        slot.native_map = Some((ret as usize, len));
        Ok(unsafe { NonNull::new_unchecked(ret.cast::<u8>()) })
    }

    fn unmap_memory(&self, memory: MemoryId) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.get_mut(&memory.0) {
            if let Some((addr, len)) = slot.native_map.take() {
                unsafe {
                    libc::munmap(addr as *mut libc::c_void, len);
                }
            }
        }
    }

    fn export_fd(&self, memory: MemoryId) -> io::Result<OwnedFd> {
        let state = self.state.lock().unwrap();
        let slot = state.slots.get(&memory.0).ok_or_else(Self::lookup_error)?;
        slot.fd.as_fd().try_clone_to_owned()
    }

    fn export_buffer(&self, memory: MemoryId) -> io::Result<Arc<dyn ShareableBuffer>> {
        let state = self.state.lock().unwrap();
        let slot = state.slots.get(&memory.0).ok_or_else(Self::lookup_error)?;
        let fd = slot.fd.as_fd().try_clone_to_owned()?;
        Ok(Arc::new(MemfdBuffer { fd }))
    }
}

fn fd_regions_or_err<'a>(buffer: &'a dyn ShareableBuffer) -> io::Result<Vec<BorrowedFd<'a>>> {
    let regions = buffer.region_fds();
    if regions.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "imported buffer has no memory regions",
        ));
    }
    Ok(regions)
}
