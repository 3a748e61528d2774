#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod addrspace;
pub mod console;
pub mod coremap;
pub mod errno;
pub mod process;
pub mod pt;
pub mod ram;
pub mod stats;
pub mod swapfile;
pub mod tlb;
pub mod vfs;
pub mod vm;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static MACHINE: Mutex<()> = Mutex::new(());

    /// Tests that touch the global machine (RAM, coremap, TLB, swap) take
    /// this guard so the harness cannot interleave them.
    pub fn serialize() -> MutexGuard<'static, ()> {
        MACHINE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
