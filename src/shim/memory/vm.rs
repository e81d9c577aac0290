//! Fixed-address mapping primitives.
//!
//! Placed mappings bypass the driver's map call entirely: the shareable
//! backing fd is mapped directly at the caller-chosen address, and
//! `MAP_FIXED` makes the base address exact rather than a hint.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::NonNull;

/// Map `len` bytes of `fd` read-write and shared at exactly `addr`.
///
/// Replaces whatever occupied the range, including a previous reservation.
pub(crate) fn map_fixed_rw(addr: NonNull<u8>, len: usize, fd: BorrowedFd<'_>) -> io::Result<NonNull<u8>> {
    let ret = unsafe {
        libc::mmap(
            addr.as_ptr().cast::<libc::c_void>(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: a successful MAP_FIXED mmap returns the requested non-null address
    Ok(unsafe { NonNull::new_unchecked(ret.cast::<u8>()) })
}

/// Replace the range at `addr` with an inaccessible anonymous mapping,
/// holding the virtual address range against reuse without granting access.
pub(crate) fn reserve_fixed(addr: NonNull<u8>, len: usize) -> io::Result<()> {
    let ret = unsafe {
        libc::mmap(
            addr.as_ptr().cast::<libc::c_void>(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Release the mapping at `addr`.
pub(crate) fn unmap(addr: NonNull<u8>, len: usize) {
    unsafe {
        libc::munmap(addr.as_ptr().cast::<libc::c_void>(), len);
    }
}

/// Current end-of-region offset of a file-backed descriptor.
pub(crate) fn region_len(fd: BorrowedFd<'_>) -> io::Result<u64> {
    let ret = unsafe { libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_END) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsFd, FromRawFd, OwnedFd};

    fn memfd(len: usize) -> OwnedFd {
        let raw = unsafe { libc::memfd_create(c"vm-test".as_ptr(), libc::MFD_CLOEXEC) };
        assert!(raw >= 0);
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        assert_eq!(unsafe { libc::ftruncate(raw, len as libc::off_t) }, 0);
        fd
    }

    // Reserve an address range the kernel considers free, to use as a
    // placed-mapping target.
    fn probe_address(len: usize) -> NonNull<u8> {
        let ret = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ret, libc::MAP_FAILED);
        unsafe { NonNull::new_unchecked(ret.cast::<u8>()) }
    }

    #[test]
    fn fixed_mapping_lands_at_requested_address() {
        let fd = memfd(4096);
        let target = probe_address(4096);

        let mapped = map_fixed_rw(target, 4096, fd.as_fd()).unwrap();
        assert_eq!(mapped, target);

        unsafe { mapped.as_ptr().write(0xa5) };
        assert_eq!(unsafe { mapped.as_ptr().read() }, 0xa5);

        unmap(mapped, 4096);
    }

    #[test]
    fn region_len_reports_file_size() {
        let fd = memfd(65536);
        assert_eq!(region_len(fd.as_fd()).unwrap(), 65536);
    }

    #[test]
    fn reservation_replaces_mapping_in_place() {
        let fd = memfd(4096);
        let target = probe_address(4096);

        let mapped = map_fixed_rw(target, 4096, fd.as_fd()).unwrap();
        reserve_fixed(mapped, 4096).unwrap();

        // The range is still occupied: an fd mapping over it at the same
        // fixed address must succeed (MAP_FIXED replaces), proving the
        // reservation held the range rather than returning it to the OS.
        let remapped = map_fixed_rw(target, 4096, fd.as_fd()).unwrap();
        assert_eq!(remapped, target);

        unmap(remapped, 4096);
    }
}
