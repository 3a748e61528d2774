use lazy_static::lazy_static;
use spin::Mutex;

use crate::addr::{VAddr, KSEG0_BASE, PAGE_FRAME, PAGE_SIZE};

pub const NUM_TLB: usize = 64;

bitflags::bitflags! {
    /// Low-word flag bits of a TLB entry. The frame number lives in the
    /// page-aligned high bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryLo: u32 {
        const VALID = 0x200;
        const DIRTY = 0x400;
    }
}

#[derive(Clone, Copy)]
struct TlbEntry {
    hi: u32,
    lo: u32,
}

struct Tlb {
    entries: [TlbEntry; NUM_TLB],
    next_victim: usize,
}

// Invalid entries park their match field in the kernel segment, where no
// user translation can ever hit.
fn invalid_hi(index: usize) -> u32 {
    KSEG0_BASE + (index * PAGE_SIZE) as u32
}

impl Tlb {
    fn new() -> Tlb {
        let mut tlb = Tlb { entries: [TlbEntry { hi: 0, lo: 0 }; NUM_TLB], next_victim: 0 };
        tlb.clear();
        tlb
    }

    fn clear(&mut self) {
        for i in 0..NUM_TLB {
            self.entries[i] = TlbEntry { hi: invalid_hi(i), lo: 0 };
        }
    }

    fn probe(&self, vaddr: VAddr) -> Option<usize> {
        let hi = vaddr.as_u32() & PAGE_FRAME;
        self.entries.iter().position(|e| e.hi == hi)
    }

    fn rr_victim(&mut self) -> usize {
        let victim = self.next_victim;
        self.next_victim = (self.next_victim + 1) % NUM_TLB;
        victim
    }
}

lazy_static! {
    static ref TLB: Mutex<Tlb> = Mutex::new(Tlb::new());
}

pub fn init() {
    let mut tlb = TLB.lock();
    tlb.clear();
    tlb.next_victim = 0;
}

pub fn probe(vaddr: VAddr) -> Option<usize> {
    TLB.lock().probe(vaddr)
}

pub fn read(index: usize) -> (u32, u32) {
    let tlb = TLB.lock();
    (tlb.entries[index].hi, tlb.entries[index].lo)
}

pub fn write(hi: u32, lo: u32, index: usize) {
    let mut tlb = TLB.lock();
    tlb.entries[index] = TlbEntry { hi, lo };
}

/// Install an entry in a free slot, or over a round-robin victim when the
/// TLB is full. Returns the chosen index and whether a free slot was found.
pub fn install(hi: u32, lo: u32) -> (usize, bool) {
    let mut tlb = TLB.lock();
    for i in 0..NUM_TLB {
        if EntryLo::from_bits_truncate(tlb.entries[i].lo).contains(EntryLo::VALID) {
            continue;
        }
        tlb.entries[i] = TlbEntry { hi, lo };
        return (i, true);
    }
    let victim = tlb.rr_victim();
    tlb.entries[victim] = TlbEntry { hi, lo };
    (victim, false)
}

/// Drop the translation for `vaddr` entirely.
pub fn evict(vaddr: VAddr) {
    let mut tlb = TLB.lock();
    if let Some(index) = tlb.probe(vaddr) {
        tlb.entries[index] = TlbEntry { hi: invalid_hi(index), lo: 0 };
    }
}

/// Clear only the VALID bit, keeping the translation so a later soft fault
/// can re-establish it.
pub fn invalidate(vaddr: VAddr) {
    let mut tlb = TLB.lock();
    if let Some(index) = tlb.probe(vaddr) {
        tlb.entries[index].lo &= !EntryLo::VALID.bits();
    }
}

pub fn invalidate_all() {
    TLB.lock().clear();
}

/// Snapshot of all entries, for consistency checks.
pub fn snapshot() -> [(u32, u32); NUM_TLB] {
    let tlb = TLB.lock();
    let mut out = [(0u32, 0u32); NUM_TLB];
    for (i, e) in tlb.entries.iter().enumerate() {
        out[i] = (e.hi, e.lo);
    }
    out
}
