use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::addr::{PAddr, VAddr, PAGE_SIZE};
use crate::{coremap, swapfile, tlb};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Resident in RAM.
        const VALID = 0b01;
        /// Dirtied at least once; a swap slot preserves the contents when
        /// the page is not resident.
        const SWAP = 0b10;
    }
}

/// Index of one page-sized slot in the swap file. Slot 0 is a legal index;
/// "no slot" is expressed by `Option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub fn new(index: u32) -> SwapSlot {
        SwapSlot(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

struct PageState {
    paddr: PAddr,
    slot: Option<SwapSlot>,
    flags: PageFlags,
}

/// Per-virtual-page descriptor. Shared between the owning page table and
/// the coremap back-pointer; the mutable residency state sits behind a leaf
/// lock and is only changed under the coremap lock or by the fault handler.
pub struct Page {
    vaddr: VAddr,
    state: Mutex<PageState>,
}

impl Page {
    pub fn new(vaddr: VAddr) -> Page {
        Page {
            vaddr,
            state: Mutex::new(PageState {
                paddr: PAddr::zero(),
                slot: None,
                flags: PageFlags::empty(),
            }),
        }
    }

    pub fn vaddr(&self) -> VAddr {
        self.vaddr
    }

    pub fn paddr(&self) -> PAddr {
        self.state.lock().paddr
    }

    pub fn set_paddr(&self, paddr: PAddr) {
        self.state.lock().paddr = paddr;
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().flags.contains(PageFlags::VALID)
    }

    pub fn set_valid(&self, valid: bool) {
        self.state.lock().flags.set(PageFlags::VALID, valid);
    }

    pub fn swap_flag(&self) -> bool {
        self.state.lock().flags.contains(PageFlags::SWAP)
    }

    pub fn set_swap_flag(&self, swap: bool) {
        self.state.lock().flags.set(PageFlags::SWAP, swap);
    }

    pub fn slot(&self) -> Option<SwapSlot> {
        self.state.lock().slot
    }

    pub fn set_slot(&self, slot: Option<SwapSlot>) {
        self.state.lock().slot = slot;
    }
}

/// One contiguous run of pages covering `[base, base + npages * PAGE_SIZE)`.
struct Region {
    base: VAddr,
    pages: Vec<Arc<Page>>,
}

impl Region {
    fn new(base: VAddr, npages: usize) -> Region {
        assert!(base.is_page_aligned());
        let mut pages = Vec::with_capacity(npages);
        for i in 0..npages {
            pages.push(Arc::new(Page::new(base.add_pages(i))));
        }
        Region { base, pages }
    }

    fn contains(&self, vaddr: VAddr) -> bool {
        vaddr >= self.base && vaddr < self.base.add_pages(self.pages.len())
    }

    fn find(&self, vaddr: VAddr) -> Option<&Arc<Page>> {
        if !self.contains(vaddr) {
            return None;
        }
        let index = (vaddr.as_u32() - self.base.as_u32()) as usize / PAGE_SIZE;
        self.pages.get(index)
    }
}

/// Per-address-space page table: three fixed regions (text, data, stack).
pub struct PageTable {
    regions: [Region; 3],
}

impl PageTable {
    pub fn new(layout: [(VAddr, usize); 3]) -> PageTable {
        PageTable {
            regions: layout.map(|(base, npages)| Region::new(base, npages)),
        }
    }

    /// Descriptor owning `vaddr`, which must be page aligned. At most one
    /// region contains any address; lookup order is text, data, stack.
    pub fn find(&self, vaddr: VAddr) -> Option<&Arc<Page>> {
        self.regions.iter().find_map(|r| r.find(vaddr))
    }

    pub fn pages(&self) -> impl Iterator<Item = &Arc<Page>> {
        self.regions.iter().flat_map(|r| r.pages.iter())
    }

    /// Release everything the table holds: TLB entries, frames, and swap
    /// slots of pages that were swapped out when their process died.
    pub fn teardown(self) {
        for page in self.pages() {
            tlb::evict(page.vaddr());
            let paddr = page.paddr();
            if !paddr.is_zero() {
                coremap::zero_frame(paddr);
            }
            if let Some(slot) = page.slot() {
                swapfile::release(slot);
                page.set_slot(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PageTable {
        PageTable::new([
            (VAddr::new(0x0040_0000), 2),
            (VAddr::new(0x1000_0000), 3),
            (VAddr::new(0x7fff_d000), 3),
        ])
    }

    #[test]
    fn find_resolves_each_region() {
        let pt = table();
        assert_eq!(pt.find(VAddr::new(0x0040_1000)).unwrap().vaddr(), VAddr::new(0x0040_1000));
        assert_eq!(pt.find(VAddr::new(0x1000_2000)).unwrap().vaddr(), VAddr::new(0x1000_2000));
        assert_eq!(pt.find(VAddr::new(0x7fff_f000)).unwrap().vaddr(), VAddr::new(0x7fff_f000));
    }

    #[test]
    fn find_misses_outside_every_region() {
        let pt = table();
        assert!(pt.find(VAddr::new(0x0040_2000)).is_none());
        assert!(pt.find(VAddr::new(0x2000_0000)).is_none());
        assert!(pt.find(VAddr::new(0x0030_0000)).is_none());
    }

    #[test]
    fn fresh_pages_start_unmapped() {
        let pt = table();
        for page in pt.pages() {
            assert!(!page.is_valid());
            assert!(!page.swap_flag());
            assert!(page.paddr().is_zero());
            assert_eq!(page.slot(), None);
        }
        assert_eq!(pt.pages().count(), 8);
    }
}
