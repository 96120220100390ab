use modular_bitfield::prelude::*;

use crate::{
    mmu::{Memory, Permissions, PhysicalMemory},
    util::{KernelError, KernelResult},
};

// 1 << 12
pub const PAGE_SIZE: usize = 4096;

pub const ONEGIG: u64 = 0x40000000;

pub const TWOMEG: u64 = 0x200000;

#[repr(u8)]
pub enum PagingMode {
    Sv39 = 8,
}

#[bitfield]
#[repr(u64)]
#[derive(Default, Clone, Copy)]
pub struct Sv39PTE {
    pub valid: bool,
    #[bits = 3]
    pub permissions: XWRPermissions,
    pub user: bool,
    pub global: bool,
    pub accessed: bool,
    pub dirty: bool,
    reserved_for_software: B2,
    ppn0: B9,
    ppn1: B9,
    ppn2: B26,
    reserved: B10,
}

impl Sv39PTE {
    pub fn from_physical_addr(addr: u64) -> Self {
        let (ppn2, ppn1, ppn0) = split_phys_addr_sv39(addr);
        Self::new().with_ppn2(ppn2).with_ppn1(ppn1).with_ppn0(ppn0)
    }

    pub fn physical_addr(&self) -> u64 {
        unsplit_phys_addr_sv39((self.ppn2(), self.ppn1(), self.ppn0()))
    }

    /// A valid entry that maps memory rather than pointing at the next level.
    pub fn is_leaf(&self) -> bool {
        self.valid() && self.permissions() != XWRPermissions::Pointer
    }
}

/// Splits a Sv39 virtual address into (VPN[2], VPN[1], VPN[0])
fn split_virt_addr_sv39(addr: u64) -> (u16, u16, u16) {
    let vpn0 = (addr >> 12) & ((1 << 9) - 1);
    let vpn1 = (addr >> 21) & ((1 << 9) - 1);
    let vpn2 = (addr >> 30) & ((1 << 9) - 1);
    (vpn2 as u16, vpn1 as u16, vpn0 as u16)
}

/// Splits a physical address into (PPN[2], PPN[1], PPN[0])
fn split_phys_addr_sv39(addr: u64) -> (u32, u16, u16) {
    let ppn0 = (addr >> 12) & ((1 << 9) - 1);
    let ppn1 = (addr >> 21) & ((1 << 9) - 1);
    let ppn2 = (addr >> 30) & ((1 << 26) - 1);
    (ppn2 as u32, ppn1 as u16, ppn0 as u16)
}

/// Merges (PPN[2], PPN[1], PPN[0]) into a physical address.
fn unsplit_phys_addr_sv39(parts: (u32, u16, u16)) -> u64 {
    let ppn2 = parts.0 as u64;
    let ppn1 = parts.1 as u64;
    let ppn0 = parts.2 as u64;
    (ppn0 << 12) | (ppn1 << 21) | (ppn2 << 30)
}

#[derive(BitfieldSpecifier, Clone, Copy, Debug, PartialEq, Eq)]
#[bits = 3]
pub enum XWRPermissions {
    Pointer = 0b000,
    ReadOnly = 0b001,
    WriteOnly = 0b010,
    ReadWrite = 0b011,
    ExecOnly = 0b100,
    ReadExec = 0b101,
    WriteExec = 0b110,
    ReadWriteExec = 0b111,
}

impl From<Permissions> for XWRPermissions {
    fn from(permissions: Permissions) -> Self {
        match (
            permissions.contains(Permissions::Read),
            permissions.contains(Permissions::Write),
            permissions.contains(Permissions::Execute),
        ) {
            (false, false, false) => XWRPermissions::Pointer,
            (true, false, false) => XWRPermissions::ReadOnly,
            (false, true, false) => XWRPermissions::WriteOnly,
            (true, true, false) => XWRPermissions::ReadWrite,
            (false, false, true) => XWRPermissions::ExecOnly,
            (true, false, true) => XWRPermissions::ReadExec,
            (false, true, true) => XWRPermissions::WriteExec,
            (true, true, true) => XWRPermissions::ReadWriteExec,
        }
    }
}

impl From<Sv39PTE> for Permissions {
    fn from(pte: Sv39PTE) -> Self {
        let mut permissions = match pte.permissions() {
            XWRPermissions::Pointer => Permissions::empty(),
            XWRPermissions::ReadOnly => Permissions::Read,
            XWRPermissions::WriteOnly => Permissions::Write,
            XWRPermissions::ReadWrite => Permissions::RW,
            XWRPermissions::ExecOnly => Permissions::Execute,
            XWRPermissions::ReadExec => Permissions::RX,
            XWRPermissions::WriteExec => Permissions::Write | Permissions::Execute,
            XWRPermissions::ReadWriteExec => Permissions::RWX,
        };
        permissions.set(Permissions::User, pte.user());
        permissions
    }
}

/// Handle to a Sv39 page table, identified by the physical address of its root.
///
/// Table pages are only ever touched through a [`PhysicalMemory`], so the same
/// walk works on real frames and on the flat memory used by tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sv39Table {
    root: u64,
}

impl Sv39Table {
    /// 512 entries of 8 bytes fill one page.
    pub const ENTRIES: usize = PAGE_SIZE / core::mem::size_of::<u64>();

    /// Allocates an empty root table.
    pub fn new<M: Memory + ?Sized>(mem: &mut M) -> KernelResult<Self> {
        let root = mem.alloc_zeroed_frame().ok_or(KernelError::OutOfMemory)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// The value to write to `satp` to translate through this table.
    pub fn satp(&self) -> u64 {
        let mode = PagingMode::Sv39 as u64;
        let ppn = self.root / PAGE_SIZE as u64;
        // bottom 44 bits of ppn
        (mode << 60) | (ppn & ((1 << 44) - 1))
    }

    fn entry_addr(table: u64, index: u16) -> u64 {
        table + index as u64 * core::mem::size_of::<u64>() as u64
    }

    fn read_entry<M: PhysicalMemory + ?Sized>(mem: &M, table: u64, index: u16) -> Sv39PTE {
        Sv39PTE::from(mem.read_u64(Self::entry_addr(table, index)))
    }

    fn write_entry<M: PhysicalMemory + ?Sized>(mem: &mut M, table: u64, index: u16, pte: Sv39PTE) {
        mem.write_u64(Self::entry_addr(table, index), u64::from(pte));
    }

    /// Follows (or creates) the next-level table behind `table[index]`.
    fn next_level<M: Memory + ?Sized>(mem: &mut M, table: u64, index: u16) -> KernelResult<u64> {
        let entry = Self::read_entry(mem, table, index);
        if entry.valid() {
            if entry.is_leaf() {
                return Err(KernelError::msg("walk ran into a superpage leaf"));
            }
            return Ok(entry.physical_addr());
        }
        let new_addr = mem.alloc_zeroed_frame().ok_or(KernelError::OutOfMemory)?;
        let pointer = Sv39PTE::from_physical_addr(new_addr)
            .with_valid(true)
            .with_permissions(XWRPermissions::Pointer);
        Self::write_entry(mem, table, index, pointer);
        Ok(new_addr)
    }

    /// Maps a 1GiB gigapage by rounding the given addresses down.
    /// Gigapages are kernel mappings: global and not user accessible.
    pub fn map_gigapage<M: PhysicalMemory + ?Sized>(
        &self,
        mem: &mut M,
        virt_addr: u64,
        phys_addr: u64,
        permissions: Permissions,
    ) {
        let (vpn2, _, _) = split_virt_addr_sv39(virt_addr);
        let pte = Sv39PTE::from_physical_addr(phys_addr & !(ONEGIG - 1))
            .with_valid(true)
            .with_global(true)
            .with_accessed(true)
            .with_dirty(true)
            .with_permissions(permissions.into());
        Self::write_entry(mem, self.root, vpn2, pte);
    }

    /// Maps a 4KiB page by rounding the given addresses down.
    pub fn map_page<M: Memory + ?Sized>(
        &self,
        mem: &mut M,
        virt_addr: u64,
        phys_addr: u64,
        permissions: Permissions,
    ) -> KernelResult<()> {
        let (vpn2, vpn1, vpn0) = split_virt_addr_sv39(virt_addr);
        let level1 = Self::next_level(mem, self.root, vpn2)?;
        let level2 = Self::next_level(mem, level1, vpn1)?;
        if Self::read_entry(mem, level2, vpn0).valid() {
            return Err(KernelError::AlreadyMapped(virt_addr & !(PAGE_SIZE as u64 - 1)));
        }
        let pte = Sv39PTE::from_physical_addr(phys_addr & !(PAGE_SIZE as u64 - 1))
            .with_valid(true)
            .with_user(permissions.contains(Permissions::User))
            .with_accessed(true)
            .with_dirty(true)
            .with_permissions(permissions.into());
        Self::write_entry(mem, level2, vpn0, pte);
        Ok(())
    }

    /// Finds the 4KiB leaf slot for `virt_addr` without allocating anything.
    fn find_page_slot<M: PhysicalMemory + ?Sized>(&self, mem: &M, virt_addr: u64) -> Option<(u64, u16)> {
        let (vpn2, vpn1, vpn0) = split_virt_addr_sv39(virt_addr);
        let root_entry = Self::read_entry(mem, self.root, vpn2);
        if !root_entry.valid() || root_entry.is_leaf() {
            return None;
        }
        let level1_entry = Self::read_entry(mem, root_entry.physical_addr(), vpn1);
        if !level1_entry.valid() || level1_entry.is_leaf() {
            return None;
        }
        Some((level1_entry.physical_addr(), vpn0))
    }

    /// Clears the 4KiB mapping of `virt_addr`, returning the frame it pointed at.
    pub fn unmap_page<M: PhysicalMemory + ?Sized>(&self, mem: &mut M, virt_addr: u64) -> Option<u64> {
        let (table, index) = self.find_page_slot(mem, virt_addr)?;
        let entry = Self::read_entry(mem, table, index);
        if !entry.is_leaf() {
            return None;
        }
        Self::write_entry(mem, table, index, Sv39PTE::new());
        Some(entry.physical_addr())
    }

    /// Returns the leaf entry (at any level) translating `virt_addr`.
    pub fn lookup<M: PhysicalMemory + ?Sized>(&self, mem: &M, virt_addr: u64) -> Option<Sv39PTE> {
        self.walk(mem, virt_addr).map(|(pte, _)| pte)
    }

    fn walk<M: PhysicalMemory + ?Sized>(&self, mem: &M, virt_addr: u64) -> Option<(Sv39PTE, u64)> {
        let (vpn2, vpn1, vpn0) = split_virt_addr_sv39(virt_addr);
        let root_entry = Self::read_entry(mem, self.root, vpn2);
        if !root_entry.valid() {
            return None;
        }
        if root_entry.is_leaf() {
            return Some((root_entry, ONEGIG));
        }
        let level1_entry = Self::read_entry(mem, root_entry.physical_addr(), vpn1);
        if !level1_entry.valid() {
            return None;
        }
        if level1_entry.is_leaf() {
            return Some((level1_entry, TWOMEG));
        }
        let level2_entry = Self::read_entry(mem, level1_entry.physical_addr(), vpn0);
        if !level2_entry.is_leaf() {
            return None;
        }
        Some((level2_entry, PAGE_SIZE as u64))
    }

    /// Looks up a virtual address.
    pub fn virt_to_phys<M: PhysicalMemory + ?Sized>(&self, mem: &M, virt_addr: u64) -> Option<u64> {
        let (pte, span) = self.walk(mem, virt_addr)?;
        Some(pte.physical_addr() + (virt_addr & (span - 1)))
    }
}
