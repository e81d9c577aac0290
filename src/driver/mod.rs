//! The downstream driver contract.
//!
//! Everything the shim needs from the vendor driver is expressed here as a
//! trait so the shim never depends on how calls reach the device. The real
//! driver is opaque; [`memfd::MemfdDriver`] is a self-contained software
//! implementation used by the examples and the test suite.

pub mod caps;
pub mod memfd;

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Arc;

pub use caps::DeviceCaps;

/// Opaque allocation identifier issued by the underlying driver.
///
/// The shim never interprets the value; it is only used as a registry key.
/// `0` is the null id: it is never registered and every operation on it is
/// forwarded to the driver untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryId(pub u64);

impl MemoryId {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// The kind of shareable backing handle an allocation can be exported as.
///
/// The two kinds are mutually exclusive per allocation: an export request
/// names exactly one of them, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// A duplicable file-backed descriptor (dma-buf style).
    Fd,
    /// A reference-counted platform buffer object.
    Buffer,
}

/// A reference-counted platform buffer whose storage is spread over one or
/// more OS-level memory regions.
///
/// Dropping the last `Arc` releases the buffer reference.
pub trait ShareableBuffer: Send + Sync {
    /// File descriptors of the buffer's constituent memory regions.
    ///
    /// Region sizes are probed by the caller (seek to end-of-region); the
    /// trait does not report them.
    fn region_fds(&self) -> Vec<BorrowedFd<'_>>;
}

/// Caller-supplied source of an allocation's backing storage.
#[derive(Clone)]
pub enum ImportSource<'a> {
    /// Import an existing file-backed descriptor. The driver adopts it; the
    /// shim keeps its own duplicate, independent of the caller's copy.
    Fd(BorrowedFd<'a>),
    /// Import an existing platform buffer. The shim takes a reference-counted
    /// hold on it.
    Buffer(Arc<dyn ShareableBuffer>),
}

/// Parameters for one allocation request.
///
/// The shim forwards this to [`DeviceDriver::allocate_memory`], possibly
/// with `export` filled in when the session requires a shareable backing
/// handle the caller did not ask for.
#[derive(Clone)]
pub struct AllocateInfo<'a> {
    /// Requested allocation size in bytes.
    pub size: u64,
    /// Index of the memory type to allocate from.
    pub memory_type: u32,
    /// Existing backing storage to import, if any.
    pub import: Option<ImportSource<'a>>,
    /// Export handle kind requested by the caller, if any.
    pub export: Option<ExportKind>,
}

impl<'a> AllocateInfo<'a> {
    #[must_use]
    pub fn new(size: u64, memory_type: u32) -> Self {
        Self {
            size,
            memory_type,
            import: None,
            export: None,
        }
    }
}

/// The underlying device driver's memory entry points.
///
/// Implementations are expected to be internally synchronized the way vendor
/// drivers are: concurrent calls on *different* allocations are safe, while
/// callers must serialize operations on the same allocation id. All fallible
/// calls report plain OS errors; the shim propagates them verbatim.
pub trait DeviceDriver {
    /// Allocate device memory. On success the returned id is live until
    /// [`free_memory`](Self::free_memory).
    fn allocate_memory(&self, info: &AllocateInfo<'_>) -> io::Result<MemoryId>;

    /// Free an allocation. Must tolerate the null id and ids the driver has
    /// never issued.
    fn free_memory(&self, memory: MemoryId);

    /// Map an allocation at a driver-chosen address (the native fallback
    /// path). `size` of `None` maps from `offset` to the end of the
    /// allocation.
    fn map_memory(&self, memory: MemoryId, offset: u64, size: Option<u64>)
    -> io::Result<NonNull<u8>>;

    /// Release a native mapping and any driver-side mapping bookkeeping.
    fn unmap_memory(&self, memory: MemoryId);

    /// Retrieve a duplicable file-backed descriptor for an allocation that
    /// was created with [`ExportKind::Fd`]. The caller owns the returned
    /// descriptor.
    fn export_fd(&self, memory: MemoryId) -> io::Result<OwnedFd>;

    /// Retrieve a platform buffer reference for an allocation that was
    /// created with [`ExportKind::Buffer`].
    fn export_buffer(&self, memory: MemoryId) -> io::Result<Arc<dyn ShareableBuffer>>;
}
