//! The slice of the virtual file system the process core depends on.

use crate::util::{KernelError, KernelResult};

bitflags::bitflags! {
    /// Flags passed to [`FileSystem::open`].
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const RDWR = Self::READ.bits | Self::WRITE.bits;
    }
}

/// An open file, as handed out by the file system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fd(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
}

/// A mounted file system (host passthrough, RAM disk, ...).
pub trait FileSystem {
    fn open(&mut self, path: &str, flags: OpenFlags) -> KernelResult<Fd>;

    /// Reads up to `buf.len()` bytes; returns how many were read (0 at end of file).
    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> KernelResult<usize>;

    fn write(&mut self, fd: Fd, data: &[u8]) -> KernelResult<usize>;

    /// Repositions the file offset, returning the new offset.
    fn seek(&mut self, fd: Fd, pos: SeekFrom) -> KernelResult<u64>;

    fn stat(&mut self, fd: Fd) -> KernelResult<Stat>;

    fn close(&mut self, fd: Fd) -> KernelResult<()>;
}

/// Fills `buf` completely, treating a short read as an I/O error.
pub fn read_exact<F: FileSystem + ?Sized>(fs: &mut F, fd: Fd, buf: &mut [u8]) -> KernelResult<()> {
    let mut done = 0;
    while done < buf.len() {
        match fs.read(fd, &mut buf[done..])? {
            0 => return Err(KernelError::Io),
            n => done += n,
        }
    }
    Ok(())
}
