use core::sync::atomic::{AtomicUsize, Ordering};

use crate::println;

/// Observable VM event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStat {
    TlbFault = 0,
    TlbFaultFree,
    TlbFaultReplace,
    TlbInvalidate,
    TlbReload,
    PageFaultZero,
    PageFaultDisk,
    ElfFileRead,
    SwapFileRead,
    SwapFileWrite,
}

pub const NUM_STATS: usize = 10;

const NAMES: [&str; NUM_STATS] = [
    "TLB Faults",
    "TLB Faults with Free",
    "TLB Faults with Replace",
    "TLB Invalidations",
    "TLB Reloads",
    "Page Faults (Zeroed)",
    "Page Faults (Disk)",
    "Page Faults from ELF",
    "Page Faults from Swapfile",
    "Swapfile Writes",
];

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicUsize = AtomicUsize::new(0);
static COUNTERS: [AtomicUsize; NUM_STATS] = [ZERO; NUM_STATS];

pub fn inc(stat: VmStat) {
    COUNTERS[stat as usize].fetch_add(1, Ordering::SeqCst);
}

pub fn get(stat: VmStat) -> usize {
    COUNTERS[stat as usize].load(Ordering::SeqCst)
}

pub fn reset() {
    for counter in COUNTERS.iter() {
        counter.store(0, Ordering::SeqCst);
    }
}

pub fn report() {
    println!("VM stats:");
    for (i, name) in NAMES.iter().enumerate() {
        println!("  {:<28} {}", name, COUNTERS[i].load(Ordering::SeqCst));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        reset();
        inc(VmStat::TlbFault);
        inc(VmStat::TlbFault);
        inc(VmStat::SwapFileWrite);
        assert_eq!(get(VmStat::TlbFault), 2);
        assert_eq!(get(VmStat::SwapFileWrite), 1);
        assert_eq!(get(VmStat::TlbReload), 0);
        reset();
        assert_eq!(get(VmStat::TlbFault), 0);
    }
}
