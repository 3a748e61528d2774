use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::{Errno, Result};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const O_RDONLY = 0;
        const O_WRONLY = 1;
        const O_RDWR = 2;
        const O_CREAT = 64;
        const O_EXCL = 128;
        const O_TRUNC = 512;
        const O_APPEND = 1024;
    }
}

/// Handle to an open file. The body is shared, so a vnode stays usable even
/// if the name table changes underneath it.
#[derive(Clone)]
pub struct Vnode {
    data: Arc<Mutex<Vec<u8>>>,
}

impl Vnode {
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes actually read; short reads happen at end of file.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    /// Write all of `buf` at `offset`, growing the file (zero-filled gap) if
    /// the write lands past the current end.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock();
        if offset + buf.len() > data.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    pub fn truncate(&self) {
        self.data.lock().clear();
    }
}

struct FileSystem {
    files: BTreeMap<String, Arc<Mutex<Vec<u8>>>>,
}

impl FileSystem {
    fn new() -> Self {
        FileSystem { files: BTreeMap::new() }
    }

    fn open(&mut self, path: &str, flags: OpenFlags, _mode: u32) -> Result<Vnode> {
        if !self.files.contains_key(path) {
            if !flags.contains(OpenFlags::O_CREAT) {
                return Err(Errno::Enoent);
            }
            self.files.insert(String::from(path), Arc::new(Mutex::new(Vec::new())));
        }

        let data = self.files.get(path).ok_or(Errno::Enoent)?.clone();
        let vnode = Vnode { data };
        if flags.contains(OpenFlags::O_TRUNC) {
            vnode.truncate();
        }
        Ok(vnode)
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        self.files.remove(path).map(|_| ()).ok_or(Errno::Enoent)
    }
}

lazy_static! {
    static ref FILE_SYSTEM: Mutex<FileSystem> = Mutex::new(FileSystem::new());
}

pub fn open(path: &str, flags: OpenFlags, mode: u32) -> Result<Vnode> {
    FILE_SYSTEM.lock().open(path, flags, mode)
}

pub fn close(_vnode: Vnode) {
    // Dropping the handle is enough; the name table keeps the body.
}

pub fn remove_file(path: &str) -> Result<()> {
    FILE_SYSTEM.lock().remove(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_without_create_fails_on_missing_file() {
        assert_eq!(
            open("/vfs-test-missing", OpenFlags::O_RDONLY, 0).err(),
            Some(Errno::Enoent)
        );
    }

    #[test]
    fn write_then_read_round_trips() {
        let vn = open("/vfs-test-rw", OpenFlags::O_RDWR | OpenFlags::O_CREAT, 0o664).unwrap();
        vn.write_at(0, b"payload").unwrap();
        let mut buf = [0u8; 16];
        let n = vn.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
        remove_file("/vfs-test-rw").unwrap();
    }

    #[test]
    fn write_past_end_zero_fills_the_gap() {
        let vn = open("/vfs-test-gap", OpenFlags::O_RDWR | OpenFlags::O_CREAT, 0o664).unwrap();
        vn.write_at(8, b"x").unwrap();
        assert_eq!(vn.len(), 9);
        let mut buf = [0xffu8; 9];
        vn.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(buf[8], b'x');
        remove_file("/vfs-test-gap").unwrap();
    }

    #[test]
    fn truncate_on_open_discards_contents() {
        let vn = open("/vfs-test-trunc", OpenFlags::O_RDWR | OpenFlags::O_CREAT, 0o664).unwrap();
        vn.write_at(0, b"stale").unwrap();
        let vn2 = open("/vfs-test-trunc", OpenFlags::O_RDWR | OpenFlags::O_TRUNC, 0o664).unwrap();
        assert_eq!(vn2.len(), 0);
        // Both handles share the same body.
        assert_eq!(vn.len(), 0);
        close(vn2);
        remove_file("/vfs-test-trunc").unwrap();
    }

    #[test]
    fn reads_past_end_return_zero_bytes() {
        let vn = open("/vfs-test-eof", OpenFlags::O_RDWR | OpenFlags::O_CREAT, 0o664).unwrap();
        vn.write_at(0, b"ab").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vn.read_at(10, &mut buf).unwrap(), 0);
        assert_eq!(vn.read_at(1, &mut buf).unwrap(), 1);
        remove_file("/vfs-test-eof").unwrap();
    }
}
