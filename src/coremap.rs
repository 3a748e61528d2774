use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::addr::{PAddr, PAGE_SIZE};
use crate::pt::Page;
use crate::{ram, swapfile, tlb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Free,
    User,
    Fixed,
    /// First frame of a multi-frame kernel allocation; the rest of the run
    /// is Fixed. The length is needed again at free time.
    KernelRun { npages: usize },
}

struct Frame {
    state: FrameState,
    page: Option<Arc<Page>>,
    used: bool,
    modified: bool,
}

impl Frame {
    const fn empty() -> Frame {
        Frame { state: FrameState::Free, page: None, used: false, modified: false }
    }

    fn is_fixed(&self) -> bool {
        matches!(self.state, FrameState::Fixed | FrameState::KernelRun { .. })
    }
}

struct Coremap {
    frames: Vec<Frame>,
    base: PAddr,
    next_victim: usize,
}

/// A victim has been claimed for `pa`; the displaced page still needs its
/// contents written out when `needs_io` is set, and its mapping torn down.
struct Eviction {
    pa: PAddr,
    victim: usize,
    old_page: Arc<Page>,
    needs_io: bool,
}

impl Coremap {
    fn empty() -> Coremap {
        Coremap { frames: Vec::new(), base: PAddr::zero(), next_victim: 0 }
    }

    fn mem_frames(&self) -> usize {
        self.frames.len()
    }

    fn frame_index(&self, paddr: PAddr) -> usize {
        assert!(paddr.is_page_aligned());
        let index = (paddr.as_usize() - self.base.as_usize()) / PAGE_SIZE;
        assert!(index < self.frames.len(), "frame address {} outside RAM", paddr);
        index
    }

    fn frame_paddr(&self, index: usize) -> PAddr {
        self.base.add_pages(index)
    }

    /// Advance the clock hand, skipping frames that can never be victims.
    fn advance(&mut self) {
        let len = self.mem_frames();
        self.next_victim = (self.next_victim + 1) % len;
        let mut steps = 0;
        while self.frames[self.next_victim].is_fixed() {
            self.next_victim = (self.next_victim + 1) % len;
            steps += 1;
            if steps > len {
                panic!("no evictable frames");
            }
        }
    }

    fn claim(&mut self, new_page: &Arc<Page>) {
        let frame = &mut self.frames[self.next_victim];
        frame.state = FrameState::User;
        frame.page = Some(new_page.clone());
        frame.used = true;
        frame.modified = false;
    }

    /// Sweep 1: take any free frame.
    fn sweep_free(&mut self, new_page: &Arc<Page>) -> Option<PAddr> {
        for _ in 0..self.mem_frames() {
            if self.frames[self.next_victim].state == FrameState::Free {
                let pa = self.frame_paddr(self.next_victim);
                self.claim(new_page);
                self.advance();
                return Some(pa);
            }
            self.advance();
        }
        None
    }

    fn begin_eviction(&mut self, new_page: &Arc<Page>) -> Eviction {
        let victim = self.next_victim;
        let old_page = self.frames[victim].page.clone().expect("user frame without an owner");
        // The old mapping goes stale before the frame changes hands.
        old_page.set_valid(false);
        let pa = self.frame_paddr(victim);
        self.claim(new_page);
        let needs_io = old_page.swap_flag();
        if needs_io {
            // Park the frame so no other allocation can take it while the
            // coremap lock is released for swap I/O.
            self.frames[victim].state = FrameState::Fixed;
        }
        Eviction { pa, victim, old_page, needs_io }
    }

    /// Sweep 2: evict a frame that is neither recently used nor modified.
    fn sweep_clean(&mut self, new_page: &Arc<Page>) -> Option<Eviction> {
        for _ in 0..self.mem_frames() {
            let frame = &self.frames[self.next_victim];
            if frame.state == FrameState::User && !frame.used && !frame.modified {
                return Some(self.begin_eviction(new_page));
            }
            self.advance();
        }
        None
    }

    /// Sweep 3: evict a not-recently-used modified frame, clearing reference
    /// bits along the way. Clearing is what bounds the outer retry loop: the
    /// next sweep 2 is guaranteed a target.
    fn sweep_dirty(&mut self, new_page: &Arc<Page>) -> Option<Eviction> {
        for _ in 0..self.mem_frames() {
            let frame = &mut self.frames[self.next_victim];
            if frame.state == FrameState::User && !frame.used && frame.modified {
                return Some(self.begin_eviction(new_page));
            }
            if frame.state == FrameState::User {
                frame.used = false;
                if let Some(page) = frame.page.clone() {
                    tlb::invalidate(page.vaddr());
                }
            }
            self.advance();
        }
        None
    }
}

lazy_static! {
    static ref COREMAP: Mutex<Coremap> = Mutex::new(Coremap::empty());
}

/// Frames consumed by the frame table itself for a RAM of `mem_frames`
/// frames. These stay Fixed forever.
pub fn overhead_frames(mem_frames: usize) -> usize {
    (mem_frames * core::mem::size_of::<Frame>() + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Take ownership of all of RAM. Called once from vm::bootstrap, after the
/// RAM bounds are known.
pub fn init() {
    let (first, last) = ram::bounds();
    assert!(first.is_page_aligned() && last.is_page_aligned());
    assert!(!first.is_zero());

    let mem_frames = (last.as_usize() - first.as_usize()) / PAGE_SIZE;
    let reserved = overhead_frames(mem_frames);
    assert!(reserved < mem_frames, "RAM too small to hold the frame table");

    let mut frames = Vec::with_capacity(mem_frames);
    for i in 0..mem_frames {
        let mut frame = Frame::empty();
        if i < reserved {
            frame.state = FrameState::Fixed;
        }
        frames.push(frame);
    }

    let mut cm = COREMAP.lock();
    *cm = Coremap { frames, base: first, next_victim: 0 };
}

/// Allocate one frame for `page`, evicting if nothing is free. Enhanced
/// second chance: free frames first, then unused+clean victims, then
/// unused+dirty ones (writing those to swap).
pub fn alloc_user_frame(page: &Arc<Page>) -> PAddr {
    let mut cm = COREMAP.lock();
    assert!(cm.mem_frames() > 0, "coremap not initialized");

    if let Some(pa) = cm.sweep_free(page) {
        return pa;
    }

    let mut num_runs = 0;
    loop {
        let eviction = match cm.sweep_clean(page) {
            Some(e) => Some(e),
            None => cm.sweep_dirty(page),
        };

        if let Some(eviction) = eviction {
            if eviction.needs_io {
                // Swap I/O can sleep; drop the lock while the victim frame
                // sits parked as Fixed.
                drop(cm);
                if let Err(err) = swapfile::write_page(&eviction.old_page) {
                    panic!("swapfile I/O error: {}", err);
                }
                cm = COREMAP.lock();
                cm.frames[eviction.victim].state = FrameState::User;
            }
            eviction.old_page.set_paddr(PAddr::zero());
            tlb::evict(eviction.old_page.vaddr());
            return eviction.pa;
        }

        num_runs += 1;
        if num_runs >= 3 {
            panic!("page replacement made no progress");
        }
    }
}

/// Allocate `npages` contiguous frames for the kernel. Never evicts; returns
/// the zero address when no free run is long enough.
pub fn alloc_kernel_frames(npages: usize) -> PAddr {
    assert!(npages > 0);
    let mut cm = COREMAP.lock();
    assert!(cm.mem_frames() > 0, "coremap not initialized");

    let mut run = 0;
    for i in 0..cm.mem_frames() {
        if cm.frames[i].state == FrameState::Free {
            run += 1;
            if run == npages {
                let start = i + 1 - npages;
                cm.frames[start].state = FrameState::KernelRun { npages };
                for j in start + 1..start + npages {
                    cm.frames[j].state = FrameState::Fixed;
                }
                return cm.frame_paddr(start);
            }
        } else {
            run = 0;
        }
    }
    PAddr::zero()
}

pub fn free_kernel_frames(paddr: PAddr) {
    let mut cm = COREMAP.lock();
    let start = cm.frame_index(paddr);
    match cm.frames[start].state {
        FrameState::KernelRun { npages } => {
            for frame in &mut cm.frames[start..start + npages] {
                *frame = Frame::empty();
            }
        }
        _ => panic!("free of {} which is not the start of a kernel allocation", paddr),
    }
}

pub fn set_used(paddr: PAddr) {
    let mut cm = COREMAP.lock();
    let index = cm.frame_index(paddr);
    cm.frames[index].used = true;
}

pub fn set_modified(paddr: PAddr) {
    let mut cm = COREMAP.lock();
    let index = cm.frame_index(paddr);
    cm.frames[index].modified = true;
}

/// Return a frame to the free pool with no owner. Used by page-table
/// teardown.
pub fn zero_frame(paddr: PAddr) {
    assert!(!paddr.is_zero());
    let mut cm = COREMAP.lock();
    let index = cm.frame_index(paddr);
    cm.frames[index] = Frame::empty();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoremapStats {
    pub mem_frames: usize,
    pub free: usize,
    pub user: usize,
    pub fixed: usize,
}

pub fn stats() -> CoremapStats {
    let cm = COREMAP.lock();
    let mut s = CoremapStats { mem_frames: cm.mem_frames(), free: 0, user: 0, fixed: 0 };
    for frame in &cm.frames {
        match frame.state {
            FrameState::Free => s.free += 1,
            FrameState::User => s.user += 1,
            FrameState::Fixed | FrameState::KernelRun { .. } => s.fixed += 1,
        }
    }
    s
}

/// Forward direction of the frame/page bijection: every User frame points at
/// a valid page mapped exactly here.
pub fn check_integrity() -> core::result::Result<(), &'static str> {
    let cm = COREMAP.lock();
    for (i, frame) in cm.frames.iter().enumerate() {
        match frame.state {
            FrameState::User => {
                let page = frame.page.as_ref().ok_or("user frame without an owner")?;
                if !page.is_valid() {
                    return Err("user frame owned by a non-resident page");
                }
                if page.paddr() != cm.frame_paddr(i) {
                    return Err("page back-pointer does not match its frame");
                }
            }
            FrameState::Free => {
                if frame.page.is_some() {
                    return Err("free frame still has an owner");
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Reference and dirty bits of the frame at `paddr`.
pub fn frame_bits(paddr: PAddr) -> (bool, bool) {
    let cm = COREMAP.lock();
    let index = cm.frame_index(paddr);
    (cm.frames[index].used, cm.frames[index].modified)
}

/// True iff the frame at `paddr` is a User frame owned by exactly `page`.
pub fn frame_owned_by(paddr: PAddr, page: &Arc<Page>) -> bool {
    let cm = COREMAP.lock();
    let index = cm.frame_index(paddr);
    let frame = &cm.frames[index];
    frame.state == FrameState::User
        && frame.page.as_ref().map_or(false, |p| Arc::ptr_eq(p, page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::VAddr;
    use crate::test_support;

    fn boot(pages: usize) {
        ram::init(pages);
        init();
        tlb::init();
    }

    fn user_page(vaddr: u32) -> Arc<Page> {
        Arc::new(Page::new(VAddr::new(vaddr)))
    }

    fn map(page: &Arc<Page>) -> PAddr {
        let pa = alloc_user_frame(page);
        page.set_paddr(pa);
        page.set_valid(true);
        pa
    }

    #[test]
    fn init_reserves_frame_table_overhead() {
        let _guard = test_support::serialize();
        boot(16);
        let s = stats();
        assert_eq!(s.mem_frames, 16);
        assert_eq!(s.fixed, overhead_frames(16));
        assert_eq!(s.free, 16 - overhead_frames(16));
        assert!(check_integrity().is_ok());
    }

    #[test]
    fn user_allocations_take_free_frames_first() {
        let _guard = test_support::serialize();
        boot(16);
        let a = user_page(0x1000_0000);
        let b = user_page(0x1000_1000);
        let pa_a = map(&a);
        let pa_b = map(&b);
        assert_ne!(pa_a, pa_b);
        assert!(frame_owned_by(pa_a, &a));
        assert!(frame_owned_by(pa_b, &b));
        assert!(check_integrity().is_ok());
    }

    #[test]
    fn clean_pages_are_evicted_without_swap() {
        let _guard = test_support::serialize();
        boot(8);
        let avail = stats().free;

        let mut pages = Vec::new();
        for i in 0..avail {
            let pg = user_page(0x1000_0000 + (i * PAGE_SIZE) as u32);
            map(&pg);
            pages.push(pg);
        }
        assert_eq!(stats().free, 0);

        // One more allocation forces an eviction. Nothing is dirty, so the
        // reference-clearing sweep plus the clean sweep must hand over a
        // frame with no swap traffic.
        let extra = user_page(0x2000_0000);
        let pa = map(&extra);
        assert!(frame_owned_by(pa, &extra));

        let displaced: Vec<_> = pages.iter().filter(|p| !p.is_valid()).collect();
        assert_eq!(displaced.len(), 1);
        assert!(displaced[0].paddr().is_zero());
        assert_eq!(displaced[0].slot(), None);
        assert!(check_integrity().is_ok());
    }

    #[test]
    fn kernel_runs_are_contiguous_and_reusable() {
        let _guard = test_support::serialize();
        boot(16);
        let a = alloc_kernel_frames(3);
        assert!(!a.is_zero());
        let b = alloc_kernel_frames(2);
        assert!(!b.is_zero());
        assert_eq!(b.as_usize() - a.as_usize(), 3 * PAGE_SIZE);

        free_kernel_frames(a);
        let c = alloc_kernel_frames(3);
        assert_eq!(c, a);
    }

    #[test]
    fn oversized_kernel_requests_fail_cleanly() {
        let _guard = test_support::serialize();
        boot(8);
        let free = stats().free;
        assert!(alloc_kernel_frames(free + 1).is_zero());
        assert_eq!(stats().free, free);
    }

    #[test]
    fn zero_frame_returns_a_frame_to_the_pool() {
        let _guard = test_support::serialize();
        boot(8);
        let pg = user_page(0x1000_0000);
        let pa = map(&pg);
        let before = stats();
        zero_frame(pa);
        let after = stats();
        assert_eq!(after.free, before.free + 1);
        assert_eq!(after.user, before.user - 1);
    }
}
