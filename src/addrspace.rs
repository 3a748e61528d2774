use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::addr::{pages_for, VAddr, PAGE_SIZE};
use crate::errno::{Errno, Result};
use crate::pt::{Page, PageTable};
use crate::stats::{self, VmStat};
use crate::{coremap, process, ram, swapfile, tlb};

/// Top of the user address space; the stack grows down from here.
pub const USERSTACK: u32 = 0x8000_0000;
pub const MAX_STACK_PAGES: usize = 12;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegFlags: u8 {
        const R = 0b001;
        const W = 0b010;
        const X = 0b100;
    }
}

/// One loadable region of the executable.
#[derive(Debug, Clone)]
pub struct Segment {
    // Page-aligned base and size in pages.
    base: VAddr,
    npages: usize,
    // Unrounded byte count actually backed by the file; the rest of the
    // last page is zero-filled.
    filesz: usize,
    // Where the segment's bytes start in the executable.
    offset: u64,
    flags: SegFlags,
}

impl Segment {
    pub fn contains(&self, vaddr: VAddr) -> bool {
        assert!(vaddr.is_page_aligned());
        vaddr >= self.base && vaddr < self.base.add_pages(self.npages)
    }

    pub fn is_writeable(&self) -> bool {
        self.flags.contains(SegFlags::W)
    }

    pub fn base(&self) -> VAddr {
        self.base
    }

    pub fn npages(&self) -> usize {
        self.npages
    }
}

/// Two ELF segments (text, data) plus the implicit stack region.
pub struct AddrSpace {
    segments: heapless::Vec<Segment, 2>,
    pt: Option<PageTable>,
    stack_pages: usize,
}

pub type AddrSpaceHandle = Arc<Mutex<AddrSpace>>;

impl AddrSpace {
    pub fn new() -> AddrSpace {
        AddrSpace { segments: heapless::Vec::new(), pt: None, stack_pages: 0 }
    }

    /// Append a segment. `vaddr` must be page aligned; `sz` is rounded up to
    /// whole pages while `filesz` keeps the exact byte count to copy.
    pub fn define_region(
        &mut self,
        vaddr: VAddr,
        sz: usize,
        readable: bool,
        writeable: bool,
        executable: bool,
        file_offset: u64,
        filesz: usize,
    ) -> Result<()> {
        assert!(vaddr.is_page_aligned());

        let mut flags = SegFlags::empty();
        flags.set(SegFlags::R, readable);
        flags.set(SegFlags::W, writeable);
        flags.set(SegFlags::X, executable);

        let segment = Segment {
            base: vaddr,
            npages: pages_for(sz),
            filesz,
            offset: file_offset,
            flags,
        };
        self.segments.push(segment).map_err(|_| Errno::Enomem)
    }

    /// Build the page table. Requires exactly the two ELF segments.
    pub fn prepare_load(&mut self) -> Result<()> {
        if self.segments.len() != 2 {
            return Err(Errno::Enomem);
        }
        let stack_base = VAddr::new(USERSTACK - (MAX_STACK_PAGES * PAGE_SIZE) as u32);
        self.pt = Some(PageTable::new([
            (self.segments[0].base, self.segments[0].npages),
            (self.segments[1].base, self.segments[1].npages),
            (stack_base, MAX_STACK_PAGES),
        ]));
        Ok(())
    }

    /// Loading is on demand, so there is nothing to finish.
    pub fn complete_load(&mut self) -> Result<()> {
        Ok(())
    }

    /// Fix the stack size and hand back the initial stack pointer.
    pub fn define_stack(&mut self) -> VAddr {
        self.stack_pages = MAX_STACK_PAGES;
        VAddr::new(USERSTACK)
    }

    pub fn stack_pages(&self) -> usize {
        self.stack_pages
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn page_table(&self) -> Option<&PageTable> {
        self.pt.as_ref()
    }

    /// True iff `vaddr` falls inside a defined segment or the stack range.
    pub fn is_userptr(&self, vaddr: VAddr) -> bool {
        let vaddr = vaddr.align_down();
        if self.segments.iter().any(|s| s.contains(vaddr)) {
            return true;
        }
        let (stack_base, stack_top) = stack_bounds(self);
        vaddr >= stack_base && vaddr < stack_top
    }

    /// Locate the page for `vaddr`, giving it a frame if it has none.
    /// `needs_load` reports whether the caller must still materialize the
    /// contents.
    pub fn get_page(&self, vaddr: VAddr, needs_load: &mut bool) -> Option<Arc<Page>> {
        let page = self.pt.as_ref()?.find(vaddr)?.clone();

        if !page.is_valid() {
            *needs_load = true;
            let paddr = coremap::alloc_user_frame(&page);
            page.set_paddr(paddr);
            page.set_valid(true);
            debug_assert!(paddr.is_page_aligned());
            debug_assert!(paddr.as_u32() < USERSTACK);
        }

        Some(page)
    }

    /// Materialize a resident page's contents: from its swap slot if it has
    /// ever been dirtied, from the executable if a segment backs it, or by
    /// zero-filling (stack and past-end-of-file pages).
    pub fn load_page(&self, page: &Arc<Page>) -> Result<()> {
        assert!(page.is_valid());
        let paddr = page.paddr();
        assert!(!paddr.is_zero());
        let vaddr = page.vaddr();

        if page.swap_flag() {
            let result = swapfile::load_page(page);
            stats::inc(VmStat::SwapFileRead);
            stats::inc(VmStat::PageFaultDisk);
            return result;
        }

        for segment in self.segments.iter() {
            if !segment.contains(vaddr) {
                continue;
            }

            let seg_off = (vaddr.as_u32() - segment.base.as_u32()) as usize;
            let len = core::cmp::min(segment.filesz.saturating_sub(seg_off), PAGE_SIZE);

            if len > 0 {
                let prog = process::current_prog().ok_or(Errno::Einval)?;
                let frame = ram::frame_slice_mut(paddr);
                let n = prog.read_at(segment.offset as usize + seg_off, &mut frame[..len])?;
                stats::inc(VmStat::ElfFileRead);
                stats::inc(VmStat::PageFaultDisk);
                // Anything the file did not cover is zero.
                frame[n..].fill(0);
            } else {
                stats::inc(VmStat::PageFaultZero);
                ram::zero_frame_bytes(paddr);
            }
            return Ok(());
        }

        stats::inc(VmStat::PageFaultZero);
        ram::zero_frame_bytes(paddr);
        Ok(())
    }

    /// Eager duplicate of this address space: same segments, fresh page
    /// table, every page with contents copied byte for byte. Copied pages
    /// are marked dirty so eviction preserves them in swap rather than
    /// re-reading the executable.
    pub fn duplicate(&self) -> Result<AddrSpace> {
        let mut new_as = AddrSpace::new();
        for segment in self.segments.iter() {
            new_as
                .segments
                .push(segment.clone())
                .map_err(|_| Errno::Enomem)?;
        }
        new_as.stack_pages = self.stack_pages;

        let Some(pt) = self.pt.as_ref() else {
            return Ok(new_as);
        };
        new_as.prepare_load()?;

        let mut buf = [0u8; PAGE_SIZE];
        for src in pt.pages() {
            if !src.is_valid() && src.slot().is_none() {
                // Never touched; the copy demand-loads it the same way.
                continue;
            }

            // Fault the source resident, then buffer its bytes before any
            // destination allocation can evict it again.
            let mut needs_load = false;
            let src = self.get_page(src.vaddr(), &mut needs_load).ok_or(Errno::Enomem)?;
            if needs_load {
                self.load_page(&src)?;
            }
            buf.copy_from_slice(ram::frame_slice(src.paddr()));

            let mut dst_needs_load = false;
            let dst = new_as
                .get_page(src.vaddr(), &mut dst_needs_load)
                .ok_or(Errno::Enomem)?;
            ram::frame_slice_mut(dst.paddr()).copy_from_slice(&buf);
            dst.set_swap_flag(true);
            coremap::set_modified(dst.paddr());
        }

        Ok(new_as)
    }
}

impl Default for AddrSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AddrSpace {
    fn drop(&mut self) {
        if let Some(pt) = self.pt.take() {
            pt.teardown();
        }
    }
}

lazy_static! {
    // Advisory: last address space activated. Only used to skip redundant
    // TLB flushes; correctness never depends on it being current.
    static ref AS_PREV: Mutex<Option<AddrSpaceHandle>> = Mutex::new(None);
}

/// Make the current process's address space the one the (single) TLB
/// describes. Skipped when nothing else ran since the last activation.
pub fn activate() {
    let Some(handle) = process::current_addrspace() else {
        // Kernel threads have no address space to activate.
        return;
    };

    // AS_PREV is only ever written by set_prev; if context-switch code
    // forgets to call it the flush below simply always happens.
    if AS_PREV.lock().as_ref().map_or(false, |p| Arc::ptr_eq(p, &handle)) {
        return;
    }

    tlb::invalidate_all();
    stats::inc(VmStat::TlbInvalidate);
}

pub fn deactivate() {
    // Nothing: stale entries are handled at the next activation.
}

/// Record the current address space as already active. For context-switch
/// code; forgetting to call this costs a TLB flush, never correctness.
pub fn set_prev() {
    *AS_PREV.lock() = process::current_addrspace();
}

pub fn clear_prev() {
    *AS_PREV.lock() = None;
}

/// Deep copy for fork. The destination is complete and independent; this
/// deliberately does not share frames with the source.
pub fn copy(src: &AddrSpaceHandle) -> Result<AddrSpaceHandle> {
    let new_as = src.lock().duplicate()?;
    Ok(Arc::new(Mutex::new(new_as)))
}

/// The stack region: empty until define_stack has fixed the size.
pub fn stack_bounds(aspace: &AddrSpace) -> (VAddr, VAddr) {
    let base = USERSTACK - (aspace.stack_pages() * PAGE_SIZE) as u32;
    (VAddr::new(base), VAddr::new(USERSTACK))
}
