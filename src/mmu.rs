//! Address-space abstractions shared by the loader, exec and the user heap.
//!
//! The kernel never dereferences a user virtual address directly. Every access
//! goes through [`UserMemory::translate`] for the page containing it, then
//! touches physical memory through [`PhysicalMemory`]. Only user pages
//! translate; the kernel's own mappings in a process table never do.

use crate::arch::mmu::{Sv39Table, PAGE_SIZE};
use crate::util::{KernelError, KernelResult};

/// Physical memory as seen by the kernel.
pub trait PhysicalMemory {
    /// Copies `buf.len()` bytes starting at physical address `pa` into `buf`.
    fn read(&self, pa: u64, buf: &mut [u8]);

    /// Copies `data` to physical address `pa`.
    fn write(&mut self, pa: u64, data: &[u8]);

    fn fill(&mut self, pa: u64, len: usize, byte: u8) {
        let chunk = [byte; 64];
        let mut done = 0;
        while done < len {
            let n = core::cmp::min(chunk.len(), len - done);
            self.write(pa + done as u64, &chunk[..n]);
            done += n;
        }
    }

    fn read_u64(&self, pa: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.read(pa, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn write_u64(&mut self, pa: u64, value: u64) {
        self.write(pa, &value.to_le_bytes());
    }
}

/// Source of physical page frames.
pub trait FrameAllocator {
    /// Returns the physical address of a free page, or `None` when exhausted.
    fn alloc_frame(&mut self) -> Option<u64>;

    fn free_frame(&mut self, pa: u64);
}

/// Everything the kernel needs to build and edit page tables.
pub trait Memory: PhysicalMemory + FrameAllocator {
    /// Allocates a frame and clears it.
    fn alloc_zeroed_frame(&mut self) -> Option<u64> {
        let pa = self.alloc_frame()?;
        self.fill(pa, PAGE_SIZE, 0);
        Some(pa)
    }
}

impl<T: PhysicalMemory + FrameAllocator + ?Sized> Memory for T {}

// Hack to make the allow work
#[allow(non_upper_case_globals)]
mod permissions_inner {
    bitflags::bitflags! {
        /// Abstract representation of page permissions.
        pub struct Permissions: u8 {
            const Read = 1 << 0;
            const Write = 1 << 1;
            const Execute = 1 << 2;
            const User = 1 << 3;
            const RW = Self::Read.bits | Self::Write.bits;
            const RX = Self::Read.bits | Self::Execute.bits;
            const RWX = Self::Read.bits | Self::Write.bits | Self::Execute.bits;
        }
    }
}

pub use permissions_inner::Permissions;

/// User mappings live in the lower half of the Sv39 space.
pub const USER_VA_LIMIT: u64 = 1 << 38;

/// How the kernel is about to touch a user page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Reading on the process's behalf: the page must be readable.
    Read,
    /// Writing on the process's behalf: the page must be writable.
    Write,
    /// Filling a page the loader just mapped, whatever its permissions.
    Load,
}

impl Access {
    /// Whether a page mapped with `permissions` may be touched this way.
    pub fn allowed_by(self, permissions: Permissions) -> bool {
        permissions.contains(Permissions::User)
            && match self {
                Access::Read => permissions.contains(Permissions::Read),
                Access::Write => permissions.contains(Permissions::Write),
                Access::Load => true,
            }
    }
}

/// A process's virtual address space, viewed from the kernel.
pub trait UserMemory {
    /// Resolves a user virtual address to a physical address, or `None`
    /// if no user page that permits `access` maps it.
    fn translate(&self, va: u64, access: Access) -> Option<u64>;

    fn read_phys(&self, pa: u64, buf: &mut [u8]);

    fn write_phys(&mut self, pa: u64, data: &[u8]);

    /// Backs the page at `va` with a fresh zeroed frame.
    fn map_zeroed(&mut self, va: u64, permissions: Permissions) -> KernelResult<()>;

    /// Removes the mapping of the page at `va` and releases its frame.
    /// Returns false if nothing was mapped there.
    fn unmap(&mut self, va: u64) -> bool;
}

/// [`UserMemory`] backed by a real Sv39 page table.
pub struct UserSpace<'a, M: Memory + ?Sized> {
    table: Sv39Table,
    mem: &'a mut M,
}

impl<'a, M: Memory + ?Sized> UserSpace<'a, M> {
    pub fn new(table: Sv39Table, mem: &'a mut M) -> Self {
        Self { table, mem }
    }
}

impl<'a, M: Memory + ?Sized> UserMemory for UserSpace<'a, M> {
    fn translate(&self, va: u64, access: Access) -> Option<u64> {
        let pte = self.table.lookup(&*self.mem, va)?;
        if !access.allowed_by(Permissions::from(pte)) {
            return None;
        }
        self.table.virt_to_phys(&*self.mem, va)
    }

    fn read_phys(&self, pa: u64, buf: &mut [u8]) {
        self.mem.read(pa, buf)
    }

    fn write_phys(&mut self, pa: u64, data: &[u8]) {
        self.mem.write(pa, data)
    }

    fn map_zeroed(&mut self, va: u64, permissions: Permissions) -> KernelResult<()> {
        let pa = self.mem.alloc_zeroed_frame().ok_or(KernelError::OutOfMemory)?;
        if let Err(e) = self.table.map_page(&mut *self.mem, va, pa, permissions) {
            self.mem.free_frame(pa);
            return Err(e);
        }
        Ok(())
    }

    fn unmap(&mut self, va: u64) -> bool {
        match self.table.unmap_page(&mut *self.mem, va) {
            Some(pa) => {
                self.mem.free_frame(pa);
                true
            }
            None => false,
        }
    }
}

/// Copies `data` into user memory at `va`, translating each page separately.
/// Every page touched must be user writable.
pub fn copy_to_user<S: UserMemory + ?Sized>(space: &mut S, va: u64, data: &[u8]) -> KernelResult<()> {
    write_user(space, va, data, Access::Write)
}

/// Like [`copy_to_user`], but also fills read-only user pages. For the
/// loader only.
pub fn load_to_user<S: UserMemory + ?Sized>(space: &mut S, va: u64, data: &[u8]) -> KernelResult<()> {
    write_user(space, va, data, Access::Load)
}

fn write_user<S: UserMemory + ?Sized>(space: &mut S, va: u64, data: &[u8], access: Access) -> KernelResult<()> {
    let mut done = 0;
    while done < data.len() {
        let cur = user_offset(va, done)?;
        let pa = space.translate(cur, access).ok_or(KernelError::BadAddress(cur))?;
        let n = core::cmp::min(data.len() - done, page_remaining(cur));
        space.write_phys(pa, &data[done..done + n]);
        done += n;
    }
    Ok(())
}

/// Copies user memory at `va` into `buf`, translating each page separately.
pub fn copy_from_user<S: UserMemory + ?Sized>(space: &S, va: u64, buf: &mut [u8]) -> KernelResult<()> {
    let mut done = 0;
    while done < buf.len() {
        let cur = user_offset(va, done)?;
        let pa = space.translate(cur, Access::Read).ok_or(KernelError::BadAddress(cur))?;
        let n = core::cmp::min(buf.len() - done, page_remaining(cur));
        space.read_phys(pa, &mut buf[done..done + n]);
        done += n;
    }
    Ok(())
}

/// Copies a NUL-terminated user string into `buf` and returns its length.
/// Fails with `ArgumentTooLong` if no terminator is found within `buf.len()` bytes.
pub fn read_user_str<S: UserMemory + ?Sized>(space: &S, va: u64, buf: &mut [u8]) -> KernelResult<usize> {
    for i in 0..buf.len() {
        let mut byte = [0u8];
        copy_from_user(space, user_offset(va, i)?, &mut byte)?;
        if byte[0] == 0 {
            return Ok(i);
        }
        buf[i] = byte[0];
    }
    Err(KernelError::ArgumentTooLong)
}

/// `va + offset`, or `BadAddress` if that wraps.
#[inline]
fn user_offset(va: u64, offset: usize) -> KernelResult<u64> {
    va.checked_add(offset as u64).ok_or(KernelError::BadAddress(va))
}

#[inline]
fn page_remaining(va: u64) -> usize {
    PAGE_SIZE - (va as usize % PAGE_SIZE)
}
