use core::fmt;

/// Kernel error numbers surfaced by the VM core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Invalid argument or fault type.
    Einval,
    /// Address not covered by any segment or the stack, or a forbidden write.
    Efault,
    /// Out of kernel memory, or page-table construction failed.
    Enomem,
    /// No such file.
    Enoent,
    /// I/O error from the filesystem, returned as-is.
    Eio,
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::Einval => "EINVAL",
            Errno::Efault => "EFAULT",
            Errno::Enomem => "ENOMEM",
            Errno::Enoent => "ENOENT",
            Errno::Eio => "EIO",
        };
        f.write_str(name)
    }
}

pub type Result<T> = core::result::Result<T, Errno>;
