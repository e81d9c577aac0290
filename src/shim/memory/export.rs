//! Backing-handle acquisition policy.
//!
//! Decides, per allocation, where the shareable backing comes from and
//! performs the single retrieval round trip when the shim itself asked the
//! driver for an export.

use crate::driver::{AllocateInfo, DeviceCaps, DeviceDriver, ExportKind, ImportSource, MemoryId};
use crate::error::{ShimError, ShimResult};
use crate::shim::memory::BackingHandle;
use std::io;
use std::sync::Arc;

/// Decision made before the driver allocate call runs.
pub(crate) enum BackingPlan {
    /// Backing already acquired from the caller's import.
    Acquired(BackingHandle),
    /// No import and no caller export request: augment the allocate request
    /// with this export kind, then retrieve the handle once it succeeds.
    Synthesize(ExportKind),
    /// The shim owns no handle: the caller requested the export itself, or
    /// the platform exports nothing.
    Detached,
}

/// Resolves the backing source with import-descriptor > import-buffer >
/// synthesized-export precedence.
pub(crate) fn plan(info: &AllocateInfo<'_>, caps: &DeviceCaps) -> ShimResult<BackingPlan> {
    match (&info.import, info.export) {
        (Some(ImportSource::Fd(fd)), _) => {
            // The duplicate stays open independent of the caller's copy.
            // Failure here is descriptor-table exhaustion.
            let dup = fd
                .try_clone_to_owned()
                .map_err(|_| ShimError::OutOfHostMemory)?;
            Ok(BackingPlan::Acquired(BackingHandle::Fd(dup)))
        }
        (Some(ImportSource::Buffer(buffer)), _) => Ok(BackingPlan::Acquired(
            BackingHandle::Buffer(Arc::clone(buffer)),
        )),
        (None, Some(_)) => Ok(BackingPlan::Detached),
        (None, None) => Ok(match caps.preferred_export() {
            Some(kind) => BackingPlan::Synthesize(kind),
            None => BackingPlan::Detached,
        }),
    }
}

/// The retrieval round trip: exactly once per allocation, immediately after
/// the allocate call succeeds, and only for an export this layer requested.
pub(crate) fn retrieve<D: DeviceDriver>(
    driver: &D,
    memory: MemoryId,
    kind: ExportKind,
) -> io::Result<BackingHandle> {
    match kind {
        ExportKind::Fd => driver.export_fd(memory).map(BackingHandle::Fd),
        ExportKind::Buffer => driver.export_buffer(memory).map(BackingHandle::Buffer),
    }
}
