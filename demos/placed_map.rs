use memshim::driver::memfd::MemfdDriver;
use memshim::{AllocateInfo, DeviceCaps, MapInfo, MemoryShim};
use std::ptr::NonNull;

fn main() {
    println!("============================================================");
    println!("             memshim - Placed Mapping Walkthrough           ");
    println!("============================================================");

    // 1. Build the session: memfd software driver + negotiated capabilities
    let caps = DeviceCaps::new().placed_mapping().fd_export().host_visible(0);
    println!(
        "[+] Session: placed mapping enabled, fd export, page size {}",
        caps.page_size
    );
    let mut shim = MemoryShim::new(MemfdDriver::new(), caps);

    // 2. Allocate host-visible memory without asking for export.
    //    The shim upgrades the request and keeps a shareable descriptor.
    let info = AllocateInfo::new(65536, 0);
    let id = shim.allocate_memory(&info).expect("allocate failed");
    println!(
        "[+] Allocated 64 KiB as id {} (instrumented: {})",
        id.0,
        shim.is_instrumented(id)
    );

    // 3. Pick a target address the way a client with its own VM layout
    //    would: reserve a free range, then ask for the mapping exactly there.
    let target = reserve_target(65536);
    println!("[+] Placing the mapping at {:p}", target.as_ptr());

    let base = shim
        .map_memory(&MapInfo {
            memory: id,
            offset: 0,
            size: None,
            placed_address: Some(target),
        })
        .expect("placed map failed");
    assert_eq!(base, target);
    println!("    Mapped at {:p}", base.as_ptr());

    unsafe { base.as_ptr().add(4096).write(0x42) };

    // 4. Re-map at the same address with an offset: idempotent, same mapping
    let window = shim
        .map_memory(&MapInfo {
            memory: id,
            offset: 4096,
            size: None,
            placed_address: Some(target),
        })
        .expect("re-map failed");
    println!(
        "    Re-mapped with offset 4096 -> {:p} (reads 0x{:02x})",
        window.as_ptr(),
        unsafe { window.as_ptr().read() }
    );

    // 5. Unmap with reservation: the range stays occupied but inaccessible
    shim.unmap_memory2(id, true).expect("reserve failed");
    println!("[+] Unmapped with reserve=true; address range is held");

    // 6. Free: descriptor closed, record gone, driver allocation released
    shim.free_memory(id);
    println!(
        "[+] Freed. Driver reports {} live allocations.",
        shim.driver().live_allocations()
    );
}

fn reserve_target(len: usize) -> NonNull<u8> {
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
    assert_ne!(ret, libc::MAP_FAILED, "could not reserve a target range");
    unsafe { NonNull::new_unchecked(ret.cast::<u8>()) }
}
