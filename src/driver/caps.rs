//! Session capability configuration.

use crate::driver::ExportKind;

/// Capabilities of the driver/platform combination for one session.
///
/// The shim reads these instead of probing global state: the host
/// environment performs its capability negotiation up front and threads the
/// result through here (maps to the physical-device property/extension
/// queries of the surrounding stack).
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    /// Placed mapping is enabled for this session.
    pub placed_mapping: bool,
    /// The driver can export allocations as file-backed descriptors.
    pub fd_export: bool,
    /// The driver can export allocations as platform buffers.
    pub buffer_export: bool,
    /// Bitmask of host-visible memory types, one bit per type index.
    pub host_visible_types: u32,
    /// OS page size; the minimum alignment for placed addresses.
    pub page_size: u64,
}

impl DeviceCaps {
    /// Starts with every capability disabled and the page size taken from
    /// the running OS.
    #[must_use]
    pub fn new() -> Self {
        Self {
            placed_mapping: false,
            fd_export: false,
            buffer_export: false,
            host_visible_types: 0,
            page_size: host_page_size(),
        }
    }

    #[must_use]
    pub const fn placed_mapping(mut self) -> Self {
        self.placed_mapping = true;
        self
    }

    #[must_use]
    pub const fn fd_export(mut self) -> Self {
        self.fd_export = true;
        self
    }

    #[must_use]
    pub const fn buffer_export(mut self) -> Self {
        self.buffer_export = true;
        self
    }

    /// Marks the memory type at `index` as host-visible.
    #[must_use]
    pub const fn host_visible(mut self, index: u32) -> Self {
        self.host_visible_types |= 1 << index;
        self
    }

    /// Whether the memory type at `index` is CPU-readable/writable through a
    /// mapping.
    #[must_use]
    pub const fn is_host_visible(&self, index: u32) -> bool {
        index < u32::BITS && self.host_visible_types & (1 << index) != 0
    }

    /// The strongest export kind this session supports: file-backed
    /// descriptors win over platform buffers. `None` when the platform
    /// exports neither.
    #[must_use]
    pub const fn preferred_export(&self) -> Option<ExportKind> {
        if self.fd_export {
            Some(ExportKind::Fd)
        } else if self.buffer_export {
            Some(ExportKind::Buffer)
        } else {
            None
        }
    }

    /// Minimum alignment for caller-chosen placed addresses.
    #[must_use]
    pub const fn min_placed_alignment(&self) -> u64 {
        self.page_size
    }
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self::new()
    }
}

/// The running OS's page size.
#[must_use]
pub fn host_page_size() -> u64 {
    // sysconf cannot fail for _SC_PAGESIZE on any supported platform
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_preference_favors_descriptors() {
        let caps = DeviceCaps::new().fd_export().buffer_export();
        assert_eq!(caps.preferred_export(), Some(ExportKind::Fd));

        let caps = DeviceCaps::new().buffer_export();
        assert_eq!(caps.preferred_export(), Some(ExportKind::Buffer));

        assert_eq!(DeviceCaps::new().preferred_export(), None);
    }

    #[test]
    fn host_visible_bitmask() {
        let caps = DeviceCaps::new().host_visible(0).host_visible(3);
        assert!(caps.is_host_visible(0));
        assert!(!caps.is_host_visible(1));
        assert!(caps.is_host_visible(3));
        assert!(!caps.is_host_visible(31));
    }

    #[test]
    fn page_size_is_sane() {
        let caps = DeviceCaps::new();
        assert!(caps.page_size >= 4096);
        assert!(caps.page_size.is_power_of_two());
        assert_eq!(caps.min_placed_alignment(), caps.page_size);
    }
}
