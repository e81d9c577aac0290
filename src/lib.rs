//! A shim layer between a client and an opaque device driver's
//! memory-allocation API.
//!
//! The shim exposes the same allocate/map/unmap/free surface as the driver
//! underneath it, while adding two capabilities the driver lacks natively:
//!
//! - **Placed mapping**: a host-visible allocation can be mapped at a
//!   caller-chosen virtual address. The shim serves these mappings itself
//!   with `mmap(MAP_SHARED | MAP_FIXED)` over a shareable backing handle,
//!   instead of forwarding to the driver's own map entry point.
//! - **Transparent exportability**: allocation requests are upgraded so that
//!   a cross-process-shareable backing handle (a duplicable file descriptor,
//!   or a platform buffer reference) exists even when the caller never asked
//!   for export.
//!
//! The driver is consumed through the [`driver::DeviceDriver`] trait and is
//! treated as the authority on everything the shim does not instrument.
//! Session capabilities (placed mapping enabled, supported export kinds,
//! host-visible memory types, page size) are threaded through an explicit
//! [`driver::DeviceCaps`] value at construction.

pub mod driver;
pub mod error;
pub mod shim;

pub use driver::{
    AllocateInfo, DeviceCaps, DeviceDriver, ExportKind, ImportSource, MemoryId, ShareableBuffer,
};
pub use error::{ShimError, ShimResult};
pub use shim::memory::{MapInfo, MemoryShim};
