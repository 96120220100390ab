//! ELF64 image loader.
//!
//! Images are read through the [`FileSystem`] collaborator and copied into a
//! process's address space page by page; the loader never assumes the
//! process's frames are contiguous.

use core::mem::size_of;

use object::elf::{FileHeader64, ProgramHeader64, ELFMAG, PF_R, PF_W, PF_X, PT_LOAD};
use object::{pod, LittleEndian as LE};

use crate::{
    arch::mmu::PAGE_SIZE,
    fs::{read_exact, FileSystem, Fd, OpenFlags, SeekFrom},
    mmu::{load_to_user, Memory, Permissions, UserMemory, USER_VA_LIMIT},
    printk,
    process::{MappedRegion, Process, SegmentType},
    util::{align_down, align_up, KernelError, KernelResult},
};

const EHDR_SIZE: usize = size_of::<FileHeader64<LE>>();
const PHDR_SIZE: usize = size_of::<ProgramHeader64<LE>>();

/// Segment contents are streamed through a buffer of this size.
const COPY_CHUNK: usize = 256;

const PAGE: u64 = PAGE_SIZE as u64;

/// The header fields the loader uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

/// A program header entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

impl SegmentType {
    /// Code is exactly R+X, data exactly R+W.
    pub fn from_flags(flags: u32) -> KernelResult<Self> {
        match flags {
            f if f == PF_R | PF_X => Ok(Self::Code),
            f if f == PF_R | PF_W => Ok(Self::Data),
            other => Err(KernelError::UnknownSegmentFlags(other)),
        }
    }

    pub fn permissions(self) -> Permissions {
        match self {
            Self::Code => Permissions::RX | Permissions::User,
            Self::Data => Permissions::RW | Permissions::User,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Code => "CODE_SEGMENT",
            Self::Data => "DATA_SEGMENT",
        }
    }
}

/// Reads and checks the file header at the start of `fd`.
///
/// Files too short to hold a header, or whose magic is wrong, are `NotElf`.
pub fn read_header<F: FileSystem + ?Sized>(fs: &mut F, fd: Fd) -> KernelResult<ImageHeader> {
    let mut raw = [0u8; EHDR_SIZE];
    fs.seek(fd, SeekFrom::Start(0))?;
    read_exact(fs, fd, &mut raw).map_err(|e| match e {
        KernelError::Io => KernelError::NotElf,
        e => e,
    })?;

    let (ehdr, _) = pod::from_bytes::<FileHeader64<LE>>(&raw).map_err(|_| KernelError::NotElf)?;
    if ehdr.e_ident.magic != ELFMAG {
        return Err(KernelError::NotElf);
    }

    let header = ImageHeader {
        entry: ehdr.e_entry.get(LE),
        phoff: ehdr.e_phoff.get(LE),
        phentsize: ehdr.e_phentsize.get(LE),
        phnum: ehdr.e_phnum.get(LE),
    };
    if header.phnum > 0 && (header.phentsize as usize) < PHDR_SIZE {
        return Err(KernelError::NotElf);
    }
    Ok(header)
}

/// Reads program header `index`. A table offset past the end of the
/// addressable file is `NotElf`.
pub fn read_segment<F: FileSystem + ?Sized>(
    fs: &mut F,
    fd: Fd,
    header: &ImageHeader,
    index: u16,
) -> KernelResult<Segment> {
    let mut raw = [0u8; PHDR_SIZE];
    let pos = (index as u64)
        .checked_mul(header.phentsize as u64)
        .and_then(|off| header.phoff.checked_add(off))
        .ok_or(KernelError::NotElf)?;
    fs.seek(fd, SeekFrom::Start(pos))?;
    read_exact(fs, fd, &mut raw)?;

    let (phdr, _) = pod::from_bytes::<ProgramHeader64<LE>>(&raw)
        .map_err(|_| KernelError::msg("malformed program header"))?;
    Ok(Segment {
        p_type: phdr.p_type.get(LE),
        flags: phdr.p_flags.get(LE),
        offset: phdr.p_offset.get(LE),
        vaddr: phdr.p_vaddr.get(LE),
        filesz: phdr.p_filesz.get(LE),
        memsz: phdr.p_memsz.get(LE),
    })
}

/// Maps one loadable segment with its flag-implied permissions and copies
/// its file bytes; the rest of its memory stays zero.
fn load_segment<M, F>(process: &mut Process, mem: &mut M, fs: &mut F, fd: Fd, seg: &Segment) -> KernelResult<()>
where
    M: Memory + ?Sized,
    F: FileSystem + ?Sized,
{
    if seg.memsz < seg.filesz {
        return Err(KernelError::SegmentSizeMismatch {
            filesz: seg.filesz,
            memsz: seg.memsz,
        });
    }
    let overflow = KernelError::AddressOverflow {
        vaddr: seg.vaddr,
        memsz: seg.memsz,
    };
    let end = seg.vaddr.checked_add(seg.memsz).ok_or(overflow)?;
    if end > USER_VA_LIMIT {
        return Err(overflow);
    }
    let seg_type = SegmentType::from_flags(seg.flags)?;

    let start = align_down(seg.vaddr, PAGE);
    if start == 0 {
        // page zero marks a free region slot
        return Err(KernelError::BadAddress(seg.vaddr));
    }
    let npages = core::cmp::max(align_up(end, PAGE) - start, PAGE) / PAGE;

    let slot = process.add_mapped_region(MappedRegion {
        va: start,
        npages,
        seg_type,
    })?;

    let mut space = process.space(mem);
    for page in 0..npages {
        space.map_zeroed(start + page * PAGE, seg_type.permissions())?;
    }
    copy_segment(&mut space, fs, fd, seg)?;

    printk!("{} added at mapped info offset:{}", seg_type.name(), slot);
    Ok(())
}

fn copy_segment<S, F>(space: &mut S, fs: &mut F, fd: Fd, seg: &Segment) -> KernelResult<()>
where
    S: UserMemory + ?Sized,
    F: FileSystem + ?Sized,
{
    let mut buf = [0u8; COPY_CHUNK];
    let mut done = 0u64;
    fs.seek(fd, SeekFrom::Start(seg.offset))?;
    while done < seg.filesz {
        let n = core::cmp::min(COPY_CHUNK as u64, seg.filesz - done) as usize;
        read_exact(fs, fd, &mut buf[..n])?;
        load_to_user(space, seg.vaddr + done, &buf[..n])?;
        done += n as u64;
    }
    Ok(())
}

/// Loads every `PT_LOAD` segment described by `header` and points the
/// process at the entry address.
pub fn load_segments<M, F>(
    process: &mut Process,
    mem: &mut M,
    fs: &mut F,
    fd: Fd,
    header: &ImageHeader,
) -> KernelResult<()>
where
    M: Memory + ?Sized,
    F: FileSystem + ?Sized,
{
    for index in 0..header.phnum {
        let seg = read_segment(fs, fd, header, index)?;
        if seg.p_type != PT_LOAD {
            continue;
        }
        load_segment(process, mem, fs, fd, &seg)?;
    }
    if let Some(end) = process.image_end() {
        process.heap.start_above(end);
    }

    process.trapframe.epc = header.entry;
    process.set_loaded(true);
    printk!("Application program entry point (virtual address): 0x{:x}", header.entry);
    Ok(())
}

/// Loads the image open at `fd` into `process`. The caller closes `fd`.
pub fn load_elf<M, F>(process: &mut Process, mem: &mut M, fs: &mut F, fd: Fd) -> KernelResult<()>
where
    M: Memory + ?Sized,
    F: FileSystem + ?Sized,
{
    let header = read_header(fs, fd)?;
    load_segments(process, mem, fs, fd, &header)
}

/// Opens `path`, loads it into `process` and closes it again.
pub fn load_program<M, F>(process: &mut Process, mem: &mut M, fs: &mut F, path: &str) -> KernelResult<()>
where
    M: Memory + ?Sized,
    F: FileSystem + ?Sized,
{
    let fd = fs.open(path, OpenFlags::READ)?;
    let loaded = load_elf(process, mem, fs, fd);
    let closed = fs.close(fd);
    loaded.and(closed)
}
