use crate::addr::{kvaddr_to_paddr, paddr_to_kvaddr, VAddr};
use crate::addrspace;
use crate::errno::{Errno, Result};
use crate::println;
use crate::stats::{self, VmStat};
use crate::tlb::{self, EntryLo};
use crate::{coremap, process, ram, swapfile};

#[derive(Debug, Clone, Copy)]
pub struct BootParams {
    pub ram_pages: usize,
    pub swap_path: &'static str,
}

impl Default for BootParams {
    fn default() -> Self {
        BootParams { ram_pages: 128, swap_path: "/swapfile" }
    }
}

/// Bring the VM subsystem up: RAM, coremap, TLB, counters, swap file.
/// Re-runnable; any previous process is torn down against the old machine
/// state first.
pub fn bootstrap(params: BootParams) {
    process::clear_current();
    addrspace::clear_prev();

    ram::init(params.ram_pages);
    coremap::init();
    tlb::init();
    stats::reset();
    if swapfile::bootstrap(params.swap_path).is_err() {
        panic!("failed to initialize swapfile");
    }

    let s = coremap::stats();
    println!(
        "vm: {} frames ({} fixed, {} free), swap {} slots",
        s.mem_frames,
        s.fixed,
        s.free,
        swapfile::SWAPFILE_FRAMES
    );
}

/// Allocate kernel-virtual pages backed by contiguous frames. Returns the
/// zero address when no contiguous run is free; kernel requests never evict
/// user pages.
pub fn alloc_kpages(npages: usize) -> VAddr {
    let paddr = coremap::alloc_kernel_frames(npages);
    if paddr.is_zero() {
        return VAddr::new(0);
    }
    paddr_to_kvaddr(paddr)
}

pub fn free_kpages(kvaddr: VAddr) {
    coremap::free_kernel_frames(kvaddr_to_paddr(kvaddr));
}

pub fn tlb_shootdown_all() {
    panic!("tlb shootdown not implemented");
}

pub fn tlb_shootdown(_vaddr: VAddr) {
    panic!("tlb shootdown not implemented");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    /// Hardware caught a write through a TLB entry without the dirty bit.
    ReadOnly,
}

/// Handle a TLB fault at `faultaddress`. Returns Ok when the access should
/// be retried, or the error the caller delivers to the offending process.
pub fn fault(kind: FaultKind, faultaddress: VAddr) -> Result<()> {
    let vaddr = faultaddress.align_down();

    let (readonly, write) = match kind {
        FaultKind::ReadOnly => (true, false),
        FaultKind::Write => (false, true),
        FaultKind::Read => (false, false),
    };

    let handle = process::current_addrspace().ok_or(Errno::Efault)?;
    let aspace = handle.lock();

    let (stack_base, stack_top) = addrspace::stack_bounds(&aspace);

    let mut in_segment = false;
    let mut is_text_segment = false;
    for segment in aspace.segments() {
        if segment.contains(vaddr) {
            if !segment.is_writeable() {
                is_text_segment = true;
            }
            in_segment = true;
        }
    }
    let in_stack = vaddr >= stack_base && vaddr < stack_top;

    if !in_segment && !in_stack {
        return Err(Errno::Efault);
    }

    let mut needs_load = false;
    let page = aspace.get_page(vaddr, &mut needs_load).ok_or(Errno::Enomem)?;

    // Soft fault: the translation is still present, only its permission or
    // valid bits need refreshing. Resolved without touching the disk.
    if let Some(index) = tlb::probe(page.vaddr()) {
        let (ehi, mut elo) = tlb::read(index);

        if readonly || write {
            if is_text_segment {
                return Err(Errno::Efault);
            }
            // The page is now dirty; from here on swap owns its contents
            // whenever it is not resident.
            coremap::set_modified(page.paddr());
            page.set_swap_flag(true);
            elo |= EntryLo::DIRTY.bits();
        }

        coremap::set_used(page.paddr());
        elo |= EntryLo::VALID.bits();
        tlb::write(ehi, elo, index);
        return Ok(());
    }

    let paddr = page.paddr();

    stats::inc(VmStat::TlbFault);
    debug_assert!(paddr.is_page_aligned());
    debug_assert!(!paddr.is_zero());

    // Install a provisional writable entry so the load below can run with
    // the mapping in place.
    let provisional = paddr.as_u32() | EntryLo::DIRTY.bits() | EntryLo::VALID.bits();
    let (index, found_free) = tlb::install(vaddr.as_u32(), provisional);
    if found_free {
        stats::inc(VmStat::TlbFaultFree);
    } else {
        stats::inc(VmStat::TlbFaultReplace);
    }

    if needs_load {
        aspace.load_page(&page)?;
    } else {
        stats::inc(VmStat::TlbReload);
    }

    // Rewrite the entry with no flag bits: the retried access takes a soft
    // fault, which is what sets the used and modified bookkeeping.
    tlb::write(vaddr.as_u32(), paddr.as_u32(), index);

    Ok(())
}
