use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::addr::VAddr;
use crate::addrspace::{self, AddrSpace, AddrSpaceHandle};
use crate::errno::Result;
use crate::vfs::{self, OpenFlags, Vnode};

pub struct Process {
    pub pid: u32,
    addrspace: Option<AddrSpaceHandle>,
    // The executable this process was loaded from; demand loading reads
    // segment bytes back out of it.
    prog: Option<Vnode>,
}

struct ProcessManager {
    current: Option<Process>,
    next_pid: u32,
}

impl ProcessManager {
    fn new() -> Self {
        ProcessManager { current: None, next_pid: 1 }
    }
}

lazy_static! {
    static ref PROCESS_MANAGER: Mutex<ProcessManager> = Mutex::new(ProcessManager::new());
}

/// Install a fresh process (with its executable vnode) as the current one.
/// The previous process, if any, is torn down by dropping it.
pub fn spawn(prog: Option<Vnode>) -> u32 {
    let mut manager = PROCESS_MANAGER.lock();
    let pid = manager.next_pid;
    manager.next_pid += 1;
    manager.current = Some(Process { pid, addrspace: None, prog });
    pid
}

pub fn clear_current() {
    PROCESS_MANAGER.lock().current = None;
}

pub fn current_pid() -> Option<u32> {
    PROCESS_MANAGER.lock().current.as_ref().map(|p| p.pid)
}

pub fn current_addrspace() -> Option<AddrSpaceHandle> {
    PROCESS_MANAGER.lock().current.as_ref().and_then(|p| p.addrspace.clone())
}

pub fn current_prog() -> Option<Vnode> {
    PROCESS_MANAGER.lock().current.as_ref().and_then(|p| p.prog.clone())
}

/// Swap the current process's address space, returning the old one (which
/// the caller may destroy by dropping).
pub fn set_current_addrspace(aspace: Option<AddrSpaceHandle>) -> Option<AddrSpaceHandle> {
    let mut manager = PROCESS_MANAGER.lock();
    let process = manager.current.as_mut()?;
    core::mem::replace(&mut process.addrspace, aspace)
}

/// A loadable segment of a program image, as the ELF reader would report it.
#[derive(Debug, Clone, Copy)]
pub struct ProgramSegment {
    pub vaddr: VAddr,
    pub memsz: usize,
    pub filesz: usize,
    pub offset: u64,
    pub readable: bool,
    pub writeable: bool,
    pub executable: bool,
}

/// Stand up a new current process running `path`: open the executable,
/// build its address space, define the stack, and activate. Returns the
/// address space and the initial stack pointer. Actual page contents load
/// on demand, fault by fault.
pub fn load_program(path: &str, segments: &[ProgramSegment]) -> Result<(AddrSpaceHandle, VAddr)> {
    let prog = vfs::open(path, OpenFlags::O_RDONLY, 0)?;
    spawn(Some(prog));

    let mut aspace = AddrSpace::new();
    for seg in segments {
        aspace.define_region(
            seg.vaddr,
            seg.memsz,
            seg.readable,
            seg.writeable,
            seg.executable,
            seg.offset,
            seg.filesz,
        )?;
    }
    aspace.prepare_load()?;
    aspace.complete_load()?;
    let stackptr = aspace.define_stack();

    let handle = Arc::new(Mutex::new(aspace));
    set_current_addrspace(Some(handle.clone()));
    addrspace::activate();

    Ok((handle, stackptr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_increase_monotonically() {
        let _guard = crate::test_support::serialize();
        clear_current();
        let a = spawn(None);
        let b = spawn(None);
        assert!(b > a);
        assert_eq!(current_pid(), Some(b));
        clear_current();
        assert_eq!(current_pid(), None);
    }

    #[test]
    fn addrspace_swap_returns_the_old_handle() {
        let _guard = crate::test_support::serialize();
        clear_current();
        assert!(set_current_addrspace(None).is_none());

        spawn(None);
        let aspace = Arc::new(Mutex::new(AddrSpace::new()));
        assert!(set_current_addrspace(Some(aspace.clone())).is_none());
        let old = set_current_addrspace(None).unwrap();
        assert!(Arc::ptr_eq(&old, &aspace));
    }
}
