use alloc::vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::addr::{PAddr, PAGE_SIZE};

// Physical addresses start above the (modeled) kernel image, so paddr 0
// stays free to mean "no frame".
const FIRST_PADDR: u32 = 0x0010_0000;

struct Ram {
    // Host address backing paddr FIRST_PADDR. Kept as usize so the global is
    // Send + Sync; access goes through frame_ptr below.
    base: usize,
    pages: usize,
}

lazy_static! {
    static ref RAM: Mutex<Ram> = Mutex::new(Ram { base: 0, pages: 0 });
}

/// Set up the machine's RAM. The backing store is leaked: physical memory
/// lives for the lifetime of the kernel, and frames handed out by the
/// coremap must never dangle.
pub fn init(pages: usize) {
    assert!(pages > 0, "RAM must have at least one page");
    let arena = vec![0u8; pages * PAGE_SIZE].leak();
    let mut ram = RAM.lock();
    ram.base = arena.as_mut_ptr() as usize;
    ram.pages = pages;
}

/// RAM bounds, first and last physical address, both page aligned.
/// The equivalent of the boot-time memory-size probe.
pub fn bounds() -> (PAddr, PAddr) {
    let ram = RAM.lock();
    assert!(ram.base != 0, "RAM not initialized");
    (
        PAddr::new(FIRST_PADDR),
        PAddr::new(FIRST_PADDR + (ram.pages * PAGE_SIZE) as u32),
    )
}

fn frame_ptr(paddr: PAddr) -> *mut u8 {
    let ram = RAM.lock();
    assert!(ram.base != 0, "RAM not initialized");
    assert!(paddr.is_page_aligned(), "unaligned frame address {}", paddr);
    assert!(
        paddr.as_u32() >= FIRST_PADDR
            && paddr.as_usize() - FIRST_PADDR as usize + PAGE_SIZE <= ram.pages * PAGE_SIZE,
        "frame address {} outside RAM",
        paddr
    );
    (ram.base + (paddr.as_usize() - FIRST_PADDR as usize)) as *mut u8
}

/// Borrow the bytes of one frame. Exclusive ownership of the frame is the
/// coremap's contract: the caller either owns the page mapped there or has
/// the frame parked FIXED.
pub fn frame_slice(paddr: PAddr) -> &'static [u8] {
    unsafe { core::slice::from_raw_parts(frame_ptr(paddr), PAGE_SIZE) }
}

pub fn frame_slice_mut(paddr: PAddr) -> &'static mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(frame_ptr(paddr), PAGE_SIZE) }
}

pub fn zero_frame_bytes(paddr: PAddr) {
    frame_slice_mut(paddr).fill(0);
}
