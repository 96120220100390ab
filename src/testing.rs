//! Host-side stand-ins for physical memory, address spaces, the file system
//! and the supervisor CSRs.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use object::elf::{
    FileHeader64, Ident, ProgramHeader64, ELFCLASS64, ELFDATA2LSB, ELFMAG, ELFOSABI_NONE, EM_RISCV,
    ET_EXEC, EV_CURRENT, PT_LOAD, PT_NOTE,
};
use object::{pod, LittleEndian as LE, U16, U32, U64};

use crate::{
    arch::{
        cpu::{Supervisor, TrapEntry},
        mmu::PAGE_SIZE,
        trap::TrapFrame,
    },
    bsp,
    fs::{FileSystem, Fd, OpenFlags, SeekFrom, Stat},
    mmu::{Access, FrameAllocator, Permissions, PhysicalMemory, UserMemory},
    physical_page_allocator::PhysicalPageAllocator,
    util::{align_down, KernelError, KernelResult},
};

const PAGE: u64 = PAGE_SIZE as u64;

/// Frames available to a [`FlatMemory`].
pub const FLAT_PAGES: usize = 256;

/// A slice of "DRAM" starting at the board's DRAM base, with a real frame pool.
pub struct FlatMemory {
    bytes: Vec<u8>,
    frames: PhysicalPageAllocator<FLAT_PAGES>,
}

impl FlatMemory {
    pub fn new() -> Self {
        let mut frames = PhysicalPageAllocator::new();
        unsafe { frames.init(bsp::DRAM_BASE as usize) };
        Self {
            bytes: vec![0; FLAT_PAGES * PAGE_SIZE],
            frames,
        }
    }

    pub fn free_pages(&self) -> usize {
        self.frames.free_pages()
    }

    fn index(&self, pa: u64, len: usize) -> core::ops::Range<usize> {
        let start = (pa - bsp::DRAM_BASE) as usize;
        assert!(start + len <= self.bytes.len(), "access past flat memory at 0x{:x}", pa);
        start..start + len
    }
}

impl PhysicalMemory for FlatMemory {
    fn read(&self, pa: u64, buf: &mut [u8]) {
        let range = self.index(pa, buf.len());
        buf.copy_from_slice(&self.bytes[range]);
    }

    fn write(&mut self, pa: u64, data: &[u8]) {
        let range = self.index(pa, data.len());
        self.bytes[range].copy_from_slice(data);
    }
}

impl FrameAllocator for FlatMemory {
    fn alloc_frame(&mut self) -> Option<u64> {
        self.frames.alloc_frame()
    }

    fn free_frame(&mut self, pa: u64) {
        self.frames.free_frame(pa)
    }
}

/// An address space without page tables: a map from virtual page to frame.
///
/// Frames are handed out top-down, so consecutive virtual pages are never
/// physically adjacent and an access that skips translation shows up.
pub struct FlatSpace {
    pages: BTreeMap<u64, (usize, Permissions)>,
    frames: Vec<Vec<u8>>,
    free: Vec<usize>,
}

impl FlatSpace {
    const TOP: u64 = 0x9000_0000;

    /// A space that can back at most `budget` pages at once.
    pub fn new(budget: usize) -> Self {
        Self {
            pages: BTreeMap::new(),
            frames: (0..budget).map(|_| vec![0; PAGE_SIZE]).collect(),
            free: (0..budget).rev().collect(),
        }
    }

    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    fn frame_pa(frame: usize) -> u64 {
        Self::TOP - (frame as u64 + 1) * PAGE
    }

    fn locate(pa: u64) -> (usize, usize) {
        let base = align_down(pa, PAGE);
        ((Self::TOP - base) as usize / PAGE_SIZE - 1, (pa - base) as usize)
    }
}

impl UserMemory for FlatSpace {
    fn translate(&self, va: u64, access: Access) -> Option<u64> {
        let (frame, permissions) = *self.pages.get(&align_down(va, PAGE))?;
        if !access.allowed_by(permissions) {
            return None;
        }
        Some(Self::frame_pa(frame) + va % PAGE)
    }

    fn read_phys(&self, pa: u64, buf: &mut [u8]) {
        let (frame, off) = Self::locate(pa);
        buf.copy_from_slice(&self.frames[frame][off..off + buf.len()]);
    }

    fn write_phys(&mut self, pa: u64, data: &[u8]) {
        let (frame, off) = Self::locate(pa);
        self.frames[frame][off..off + data.len()].copy_from_slice(data);
    }

    fn map_zeroed(&mut self, va: u64, permissions: Permissions) -> KernelResult<()> {
        let page = align_down(va, PAGE);
        if self.pages.contains_key(&page) {
            return Err(KernelError::AlreadyMapped(page));
        }
        let frame = self.free.pop().ok_or(KernelError::OutOfMemory)?;
        self.frames[frame].iter_mut().for_each(|b| *b = 0);
        self.pages.insert(page, (frame, permissions));
        Ok(())
    }

    fn unmap(&mut self, va: u64) -> bool {
        match self.pages.remove(&align_down(va, PAGE)) {
            Some((frame, _)) => {
                self.free.push(frame);
                true
            }
            None => false,
        }
    }
}

struct OpenFile {
    path: String,
    pos: u64,
}

/// An in-memory file system keyed by path.
#[derive(Default)]
pub struct MemFs {
    files: BTreeMap<String, Vec<u8>>,
    open: BTreeMap<usize, OpenFile>,
    next_fd: usize,
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            next_fd: 3,
            ..Default::default()
        }
    }

    pub fn add(&mut self, path: &str, contents: Vec<u8>) {
        self.files.insert(path.to_string(), contents);
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    fn file(&mut self, fd: Fd) -> KernelResult<(&mut OpenFile, &mut Vec<u8>)> {
        let open = self.open.get_mut(&fd.0).ok_or(KernelError::BadDescriptor)?;
        let data = self.files.get_mut(&open.path).ok_or(KernelError::Io)?;
        Ok((open, data))
    }
}

impl FileSystem for MemFs {
    fn open(&mut self, path: &str, flags: OpenFlags) -> KernelResult<Fd> {
        if !self.files.contains_key(path) {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(KernelError::NotFound);
            }
            self.add(path, Vec::new());
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        self.open.insert(
            fd,
            OpenFile {
                path: path.to_string(),
                pos: 0,
            },
        );
        Ok(Fd(fd))
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> KernelResult<usize> {
        let (open, data) = self.file(fd)?;
        let start = core::cmp::min(open.pos as usize, data.len());
        let n = core::cmp::min(buf.len(), data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        open.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, fd: Fd, bytes: &[u8]) -> KernelResult<usize> {
        let (open, data) = self.file(fd)?;
        let start = open.pos as usize;
        if data.len() < start + bytes.len() {
            data.resize(start + bytes.len(), 0);
        }
        data[start..start + bytes.len()].copy_from_slice(bytes);
        open.pos += bytes.len() as u64;
        Ok(bytes.len())
    }

    fn seek(&mut self, fd: Fd, pos: SeekFrom) -> KernelResult<u64> {
        let (open, data) = self.file(fd)?;
        let new = match pos {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::Current(delta) => open.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => (data.len() as u64).checked_add_signed(delta),
        };
        open.pos = new.ok_or(KernelError::Io)?;
        Ok(open.pos)
    }

    fn stat(&mut self, fd: Fd) -> KernelResult<Stat> {
        let (_, data) = self.file(fd)?;
        Ok(Stat {
            size: data.len() as u64,
        })
    }

    fn close(&mut self, fd: Fd) -> KernelResult<()> {
        self.open
            .remove(&fd.0)
            .map(|_| ())
            .ok_or(KernelError::BadDescriptor)
    }
}

struct BuiltSegment {
    p_type: u32,
    flags: u32,
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

/// Builds little-endian RISC-V ELF64 executables.
pub struct ElfBuilder {
    entry: u64,
    segments: Vec<BuiltSegment>,
}

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    /// Adds a `PT_LOAD` entry whose file bytes are `data`.
    pub fn segment(mut self, flags: u32, vaddr: u64, data: &[u8], memsz: u64) -> Self {
        self.segments.push(BuiltSegment {
            p_type: PT_LOAD,
            flags,
            vaddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    /// Adds a `PT_NOTE` entry the loader should ignore.
    pub fn note(mut self, len: usize) -> Self {
        self.segments.push(BuiltSegment {
            p_type: PT_NOTE,
            flags: 0,
            vaddr: 0,
            data: vec![0; len],
            memsz: len as u64,
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        let ehsize = core::mem::size_of::<FileHeader64<LE>>();
        let phentsize = core::mem::size_of::<ProgramHeader64<LE>>();
        let header = FileHeader64::<LE> {
            e_ident: Ident {
                magic: ELFMAG,
                class: ELFCLASS64,
                data: ELFDATA2LSB,
                version: EV_CURRENT,
                os_abi: ELFOSABI_NONE,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: U16::new(LE, ET_EXEC),
            e_machine: U16::new(LE, EM_RISCV),
            e_version: U32::new(LE, EV_CURRENT as u32),
            e_entry: U64::new(LE, self.entry),
            e_phoff: U64::new(LE, ehsize as u64),
            e_shoff: U64::new(LE, 0),
            e_flags: U32::new(LE, 0),
            e_ehsize: U16::new(LE, ehsize as u16),
            e_phentsize: U16::new(LE, phentsize as u16),
            e_phnum: U16::new(LE, self.segments.len() as u16),
            e_shentsize: U16::new(LE, 0),
            e_shnum: U16::new(LE, 0),
            e_shstrndx: U16::new(LE, 0),
        };

        let mut image = pod::bytes_of(&header).to_vec();
        let mut offset = (ehsize + phentsize * self.segments.len()) as u64;
        for seg in &self.segments {
            let phdr = ProgramHeader64::<LE> {
                p_type: U32::new(LE, seg.p_type),
                p_flags: U32::new(LE, seg.flags),
                p_offset: U64::new(LE, offset),
                p_vaddr: U64::new(LE, seg.vaddr),
                p_paddr: U64::new(LE, seg.vaddr),
                p_filesz: U64::new(LE, seg.data.len() as u64),
                p_memsz: U64::new(LE, seg.memsz),
                p_align: U64::new(LE, PAGE),
            };
            image.extend_from_slice(pod::bytes_of(&phdr));
            offset += seg.data.len() as u64;
        }
        for seg in &self.segments {
            image.extend_from_slice(&seg.data);
        }
        image
    }
}

pub const MOCK_TRAP_VECTOR: u64 = 0x8000_1000;
pub const MOCK_TRAP_HANDLER: u64 = 0x8000_2000;

/// The panic payload [`MockCpu::return_to_user`] unwinds with.
pub struct UserEntry(pub TrapFrame);

/// Records CSR writes instead of performing them.
#[derive(Debug, Default)]
pub struct MockCpu {
    pub stvec: Option<u64>,
    pub sstatus: u64,
    pub sepc: Option<u64>,
    pub satp: u64,
    /// Every CSR write in order, by name.
    pub writes: Vec<&'static str>,
}

impl MockCpu {
    /// A hart running the kernel: previous privilege S, kernel satp installed.
    pub fn new() -> Self {
        Self {
            sstatus: 1 << 8,
            satp: 0x8000_0000_0008_0000,
            ..Default::default()
        }
    }
}

impl Supervisor for MockCpu {
    fn trap_entry(&self) -> TrapEntry {
        TrapEntry {
            vector: MOCK_TRAP_VECTOR,
            handler: MOCK_TRAP_HANDLER,
        }
    }

    fn set_stvec(&mut self, addr: u64) {
        self.writes.push("stvec");
        self.stvec = Some(addr);
    }

    fn sstatus(&self) -> u64 {
        self.sstatus
    }

    fn set_sstatus(&mut self, value: u64) {
        self.writes.push("sstatus");
        self.sstatus = value;
    }

    fn set_sepc(&mut self, pc: u64) {
        self.writes.push("sepc");
        self.sepc = Some(pc);
    }

    fn satp(&self) -> u64 {
        self.satp
    }

    fn set_satp(&mut self, value: u64) {
        self.writes.push("satp");
        self.satp = value;
    }

    fn return_to_user(&mut self, frame: *mut TrapFrame) -> ! {
        self.writes.push("sret");
        // Safety: callers pass a frame they own
        let frame = unsafe { (*frame).clone() };
        panic::resume_unwind(Box::new(UserEntry(frame)))
    }
}

/// Runs `f` until it enters user mode through a [`MockCpu`] and returns the
/// frame it entered with.
pub fn catch_user_entry<F: FnOnce()>(f: F) -> TrapFrame {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => panic!("returned without entering user mode"),
        Err(payload) => match payload.downcast::<UserEntry>() {
            Ok(entry) => entry.0,
            Err(other) => panic::resume_unwind(other),
        },
    }
}
