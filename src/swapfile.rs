use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::addr::PAGE_SIZE;
use crate::errno::{Errno, Result};
use crate::pt::{Page, SwapSlot};
use crate::stats::{self, VmStat};
use crate::vfs::{self, OpenFlags, Vnode};
use crate::ram;

pub const SWAPFILE_SIZE: usize = 9 * 1024 * 1024;
pub const SWAPFILE_FRAMES: usize = SWAPFILE_SIZE / PAGE_SIZE;

struct SwapFile {
    vnode: Option<Vnode>,
    // Slots returned by successful loads, ready for reuse.
    free: heapless::Vec<u32, SWAPFILE_FRAMES>,
    // High-water mark for never-used slots.
    next_frame: u32,
}

lazy_static! {
    static ref SWAP: Mutex<SwapFile> = Mutex::new(SwapFile {
        vnode: None,
        free: heapless::Vec::new(),
        next_frame: 0,
    });
    // Serializes all I/O against the swap vnode; held across reads and
    // writes but never while only slot bookkeeping changes.
    static ref SWAP_IO: Mutex<()> = Mutex::new(());
}

/// Open (and truncate) the backing file. Swap contents never survive a
/// reboot; slots are meaningless once page tables are gone.
pub fn bootstrap(path: &str) -> Result<()> {
    let vnode = vfs::open(
        path,
        OpenFlags::O_RDWR | OpenFlags::O_CREAT | OpenFlags::O_TRUNC,
        0o664,
    )?;
    let mut swap = SWAP.lock();
    swap.vnode = Some(vnode);
    swap.free.clear();
    swap.next_frame = 0;
    Ok(())
}

fn alloc_slot(page: &Arc<Page>) -> Option<SwapSlot> {
    let mut swap = SWAP.lock();
    if let Some(index) = swap.free.pop() {
        let slot = SwapSlot::new(index);
        page.set_slot(Some(slot));
        return Some(slot);
    }
    if (swap.next_frame as usize) < SWAPFILE_FRAMES {
        let slot = SwapSlot::new(swap.next_frame);
        swap.next_frame += 1;
        page.set_slot(Some(slot));
        return Some(slot);
    }
    None
}

fn return_slot(slot: SwapSlot, page: &Arc<Page>) {
    let mut swap = SWAP.lock();
    if swap.free.push(slot.index()).is_err() {
        panic!("swapfile free list overflow");
    }
    page.set_slot(None);
}

/// Give back a slot that no page owns anymore (page-table teardown).
pub fn release(slot: SwapSlot) {
    let mut swap = SWAP.lock();
    if swap.free.push(slot.index()).is_err() {
        panic!("swapfile free list overflow");
    }
}

fn vnode() -> Vnode {
    SWAP.lock().vnode.clone().expect("swapfile not initialized")
}

/// Write the page's current frame contents to a newly allocated slot. The
/// page must not already own a slot: the caller just decided to evict it.
pub fn write_page(page: &Arc<Page>) -> Result<()> {
    assert!(page.slot().is_none());

    let slot = alloc_slot(page);
    stats::inc(VmStat::SwapFileWrite);
    let slot = match slot {
        Some(slot) => slot,
        None => panic!("out of swap space"),
    };

    let paddr = page.paddr();
    assert!(!paddr.is_zero());

    let vn = vnode();
    let _io = SWAP_IO.lock();
    let offset = slot.index() as usize * PAGE_SIZE;
    match vn.write_at(offset, ram::frame_slice(paddr)) {
        Ok(_) => Ok(()),
        Err(err) => {
            drop(_io);
            return_slot(slot, page);
            Err(err)
        }
    }
}

/// Read the page's slot back into the frame at its current paddr. On
/// success the slot is released: the authoritative copy is in RAM again.
/// On failure the slot stays assigned.
pub fn load_page(page: &Arc<Page>) -> Result<()> {
    let slot = page.slot().ok_or(Errno::Einval)?;

    let paddr = page.paddr();
    assert!(!paddr.is_zero());

    let vn = vnode();
    {
        let _io = SWAP_IO.lock();
        let offset = slot.index() as usize * PAGE_SIZE;
        let n = vn.read_at(offset, ram::frame_slice_mut(paddr))?;
        if n != PAGE_SIZE {
            return Err(Errno::Eio);
        }
    }

    return_slot(slot, page);
    Ok(())
}

/// Free-list contents and high-water mark, for slot-accounting checks.
pub fn slot_partition() -> (Vec<u32>, u32) {
    let swap = SWAP.lock();
    (swap.free.iter().copied().collect(), swap.next_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::VAddr;
    use crate::test_support;
    use crate::{coremap, tlb};

    fn boot() {
        ram::init(8);
        coremap::init();
        tlb::init();
        stats::reset();
        bootstrap("/swapfile").unwrap();
    }

    fn resident_page(vaddr: u32) -> Arc<Page> {
        let page = Arc::new(Page::new(VAddr::new(vaddr)));
        let pa = coremap::alloc_user_frame(&page);
        page.set_paddr(pa);
        page.set_valid(true);
        page
    }

    #[test]
    fn slots_allocate_from_high_water_then_reuse_returns() {
        let _guard = test_support::serialize();
        boot();

        let a = resident_page(0x1000_0000);
        let b = resident_page(0x1000_1000);
        write_page(&a).unwrap();
        write_page(&b).unwrap();
        assert_eq!(a.slot().map(SwapSlot::index), Some(0));
        assert_eq!(b.slot().map(SwapSlot::index), Some(1));

        // Loading A frees slot 0; the next write takes it back before
        // advancing the high-water mark.
        load_page(&a).unwrap();
        assert_eq!(a.slot(), None);
        write_page(&a).unwrap();
        assert_eq!(a.slot().map(SwapSlot::index), Some(0));

        let (free, next_frame) = slot_partition();
        assert!(free.is_empty());
        assert_eq!(next_frame, 2);
    }

    #[test]
    fn page_contents_round_trip_through_swap() {
        let _guard = test_support::serialize();
        boot();

        let page = resident_page(0x1000_0000);
        let frame = ram::frame_slice_mut(page.paddr());
        for (i, byte) in frame.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        write_page(&page).unwrap();
        ram::zero_frame_bytes(page.paddr());
        assert!(ram::frame_slice(page.paddr()).iter().all(|&b| b == 0));

        load_page(&page).unwrap();
        let frame = ram::frame_slice(page.paddr());
        for (i, byte) in frame.iter().enumerate() {
            assert_eq!(*byte, (i % 251) as u8);
        }
        assert_eq!(page.slot(), None);
    }

    #[test]
    fn load_without_a_slot_is_einval() {
        let _guard = test_support::serialize();
        boot();
        let page = resident_page(0x1000_0000);
        assert_eq!(load_page(&page), Err(Errno::Einval));
    }

    #[test]
    fn write_and_load_count_into_vm_stats() {
        let _guard = test_support::serialize();
        boot();
        let page = resident_page(0x1000_0000);
        write_page(&page).unwrap();
        assert_eq!(stats::get(VmStat::SwapFileWrite), 1);
    }
}
