//! Replacing a process's image with a new program and one argument.

use core::convert::Infallible;

use crate::{
    arch::{cpu::Supervisor, trap::Regs, trap::TrapFrame},
    elf,
    fs::{FileSystem, OpenFlags},
    mmu::{copy_to_user, read_user_str, Memory, UserMemory, UserSpace},
    printk,
    process::USER_STACK_TOP,
    switch::{self, HartContext},
    util::{align_down, KernelError, KernelResult},
};

/// Longest path or argument exec accepts, terminator included.
pub const MAX_ARG_LEN: usize = 256;

/// A string copied out of the old image, so it survives teardown.
#[derive(Clone, Copy)]
pub struct ArgString {
    buf: [u8; MAX_ARG_LEN],
    len: usize,
}

impl ArgString {
    pub fn new(s: &str) -> KernelResult<Self> {
        if s.len() >= MAX_ARG_LEN {
            return Err(KernelError::ArgumentTooLong);
        }
        let mut buf = [0u8; MAX_ARG_LEN];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self { buf, len: s.len() })
    }

    /// Copies the NUL-terminated string at `va` in `space`.
    pub fn from_user<S: UserMemory + ?Sized>(space: &S, va: u64) -> KernelResult<Self> {
        let mut buf = [0u8; MAX_ARG_LEN];
        let len = read_user_str(space, va, &mut buf)?;
        Ok(Self { buf, len })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The string as a path. Paths that are not UTF-8 cannot name a file.
    pub fn as_str(&self) -> KernelResult<&str> {
        core::str::from_utf8(self.as_bytes()).map_err(|_| KernelError::NotFound)
    }
}

impl core::fmt::Debug for ArgString {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.as_str() {
            Ok(s) => write!(f, "{:?}", s),
            Err(_) => write!(f, "{:?}", self.as_bytes()),
        }
    }
}

/// Pushes `args` below the frame's stack pointer, C style.
///
/// Each string (plus NUL) sits in its own 8-byte aligned buffer, each below
/// the previous one. Below the lowest buffer is an array of pointer cells,
/// one per string. On return `a0` is the count, `a1` the address of the
/// first cell, and `sp` is 16-byte aligned at or below it.
pub fn push_arguments<S: UserMemory + ?Sized>(
    frame: &mut TrapFrame,
    space: &mut S,
    args: &[&[u8]],
) -> KernelResult<()> {
    let below = |top: u64, arg: &[u8]| {
        top.checked_sub(arg.len() as u64 + 1)
            .map(|va| align_down(va, 8))
            .ok_or(KernelError::BadAddress(top))
    };

    let mut lowest = frame.regs.sp;
    for arg in args {
        lowest = below(lowest, *arg)?;
    }
    let cells = lowest
        .checked_sub(8 * args.len() as u64)
        .ok_or(KernelError::BadAddress(lowest))?;

    let mut top = frame.regs.sp;
    for (i, arg) in args.iter().enumerate() {
        let buf = below(top, *arg)?;
        copy_to_user(space, buf, arg)?;
        copy_to_user(space, buf + arg.len() as u64, &[0])?;
        copy_to_user(space, cells + 8 * i as u64, &buf.to_le_bytes())?;
        top = buf;
    }

    frame.regs.a0 = args.len() as u64;
    frame.regs.a1 = cells;
    frame.regs.sp = align_down(cells, 16);
    Ok(())
}

/// Pushes the single exec argument. See [`push_arguments`].
pub fn push_argument<S: UserMemory + ?Sized>(frame: &mut TrapFrame, space: &mut S, arg: &[u8]) -> KernelResult<()> {
    push_arguments(frame, space, &[arg])
}

/// Replaces the image running in `ctx` with the program at `path`.
///
/// The file is opened and its header checked first; those failures are
/// returned and leave the process untouched. Past that point the old image
/// is gone, so any error halts the hart. On success the process is ready
/// for [`switch::switch_to`].
pub fn replace_image<M, F>(
    ctx: &mut HartContext,
    mem: &mut M,
    fs: &mut F,
    path: &ArgString,
    arg: &ArgString,
) -> KernelResult<()>
where
    M: Memory + ?Sized,
    F: FileSystem + ?Sized,
{
    let path = path.as_str()?;
    let fd = fs.open(path, OpenFlags::READ)?;
    let header = match elf::read_header(fs, fd) {
        Ok(header) => header,
        Err(e) => {
            let _ = fs.close(fd);
            return Err(e);
        }
    };
    printk!("Application: {}", path);

    let process = &mut ctx.process;
    process.exec_clean(mem);
    process.trapframe.regs = Regs::zeroed();
    process.trapframe.regs.sp = USER_STACK_TOP;

    let pagetable = process.pagetable;
    let pushed = push_argument(
        &mut process.trapframe,
        &mut UserSpace::new(pagetable, mem),
        arg.as_bytes(),
    );
    let loaded = pushed.and_then(|_| elf::load_segments(process, mem, fs, fd, &header));
    let closed = fs.close(fd);
    if let Err(e) = loaded.and(closed) {
        panic!("hart {}: exec of {} failed after teardown: {}", ctx.hartid, path, e);
    }
    Ok(())
}

/// Runs `path` with one argument in place of the current image. Only
/// returns if the program could not be opened or is not an ELF image.
pub fn exec<M, F, C>(
    ctx: &mut HartContext,
    mem: &mut M,
    fs: &mut F,
    cpu: &mut C,
    path: &ArgString,
    arg: &ArgString,
) -> KernelResult<Infallible>
where
    M: Memory + ?Sized,
    F: FileSystem + ?Sized,
    C: Supervisor + ?Sized,
{
    replace_image(ctx, mem, fs, path, arg)?;
    switch::switch_to(ctx, cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::copy_from_user;
    use crate::process::{MappedRegion, SegmentType};
    use crate::testing::{catch_user_entry, ElfBuilder, FlatMemory, FlatSpace, MemFs, MockCpu};
    use object::elf::{PF_R, PF_W, PF_X};

    fn read_u64<S: UserMemory>(space: &S, va: u64) -> u64 {
        let mut raw = [0u8; 8];
        copy_from_user(space, va, &mut raw).unwrap();
        u64::from_le_bytes(raw)
    }

    fn stack_space(sp: u64) -> (TrapFrame, FlatSpace) {
        let mut space = FlatSpace::new(2);
        space
            .map_zeroed(sp - 1, crate::mmu::Permissions::RW | crate::mmu::Permissions::User)
            .unwrap();
        let mut frame = TrapFrame::new();
        frame.regs.sp = sp;
        (frame, space)
    }

    #[test]
    fn pushes_one_argument() {
        let sp = 0x7fff_f000;
        let (mut frame, mut space) = stack_space(sp);

        push_argument(&mut frame, &mut space, b"hello").unwrap();

        let buf = (sp - 6) & !7;
        let cell = buf - 8;
        let mut text = [0u8; 6];
        copy_from_user(&space, buf, &mut text).unwrap();
        assert_eq!(&text, b"hello\0");
        assert_eq!(text[0], b'h');
        assert_eq!(read_u64(&space, cell), buf);
        assert_eq!(frame.regs.a0, 1);
        assert_eq!(frame.regs.a1, cell);
        assert!(frame.regs.sp <= cell);
        assert_eq!(frame.regs.sp % 16, 0);
    }

    #[test]
    fn pushes_from_an_unaligned_stack_pointer() {
        let sp = 0x7fff_efe3;
        let (mut frame, mut space) = stack_space(sp);

        push_argument(&mut frame, &mut space, b"a longer argument").unwrap();

        let buf = frame.regs.a1 + 8;
        assert_eq!(buf % 8, 0);
        assert!(buf + 18 <= sp);
        assert_eq!(read_u64(&space, frame.regs.a1), buf);
        assert_eq!(frame.regs.sp % 16, 0);
    }

    #[test]
    fn pushes_several_arguments() {
        let sp = 0x7fff_f000;
        let (mut frame, mut space) = stack_space(sp);

        push_arguments(&mut frame, &mut space, &[&b"ls"[..], &b"-l"[..], &b"/bin"[..]]).unwrap();

        assert_eq!(frame.regs.a0, 3);
        for (i, want) in [&b"ls"[..], &b"-l"[..], &b"/bin"[..]].iter().enumerate() {
            let ptr = read_u64(&space, frame.regs.a1 + 8 * i as u64);
            assert_eq!(ptr % 8, 0);
            let mut got = vec![0u8; want.len() + 1];
            copy_from_user(&space, ptr, &mut got).unwrap();
            assert_eq!(&got[..want.len()], *want);
            assert_eq!(got[want.len()], 0);
        }
    }

    #[test]
    fn argument_strings_are_bounded() {
        let long = "x".repeat(MAX_ARG_LEN);
        assert_eq!(ArgString::new(&long).unwrap_err(), KernelError::ArgumentTooLong);
        assert_eq!(ArgString::new(&long[1..]).unwrap().as_bytes().len(), MAX_ARG_LEN - 1);
    }

    fn program(entry: u64, code_va: u64) -> Vec<u8> {
        ElfBuilder::new(entry)
            .segment(PF_R | PF_X, code_va, &[0x13; 64], 64)
            .segment(PF_R | PF_W, code_va + 0x1000, b"rw", 0x100)
            .build()
    }

    fn booted(mem: &mut FlatMemory, fs: &mut MemFs) -> HartContext {
        let mut ctx = HartContext::new(0, mem).unwrap();
        elf::load_program(&mut ctx.process, mem, fs, "/bin/init").unwrap();
        ctx
    }

    #[test]
    fn bad_path_leaves_the_process_alone() {
        let mut mem = FlatMemory::new();
        let mut fs = MemFs::new();
        fs.add("/bin/init", program(0x10000, 0x10000));
        fs.add("/bin/notes.txt", b"just some text, no header here at all .........................".to_vec());
        let mut ctx = booted(&mut mem, &mut fs);
        let regions = ctx.process.mapped_info;
        let frame = ctx.process.trapframe.clone();
        let mut cpu = MockCpu::new();

        let arg = ArgString::new("x").unwrap();
        let missing = ArgString::new("/bin/missing").unwrap();
        assert_eq!(
            exec(&mut ctx, &mut mem, &mut fs, &mut cpu, &missing, &arg).unwrap_err(),
            KernelError::NotFound
        );
        let text = ArgString::new("/bin/notes.txt").unwrap();
        assert_eq!(
            exec(&mut ctx, &mut mem, &mut fs, &mut cpu, &text, &arg).unwrap_err(),
            KernelError::NotElf
        );

        assert_eq!(ctx.process.mapped_info, regions);
        assert_eq!(ctx.process.trapframe, frame);
        assert!(ctx.process.is_loaded());
        assert!(cpu.writes.is_empty());
        assert_eq!(fs.open_count(), 0);
    }

    #[test]
    fn exec_replaces_the_image_and_enters_it() {
        let mut mem = FlatMemory::new();
        let mut fs = MemFs::new();
        fs.add("/bin/init", program(0x10000, 0x10000));
        fs.add("/bin/app", program(0x30010, 0x30000));
        let mut ctx = booted(&mut mem, &mut fs);
        {
            let mut space = ctx.process.space(&mut mem);
            ctx.process.heap.allocate(&mut space, 64).unwrap();
        }
        let cursor = ctx.process.heap.cursor();
        let mut cpu = MockCpu::new();

        let path = ArgString::new("/bin/app").unwrap();
        let arg = ArgString::new("hello").unwrap();
        let frame = catch_user_entry(|| {
            let _ = exec(&mut ctx, &mut mem, &mut fs, &mut cpu, &path, &arg);
        });

        assert_eq!(frame.epc, 0x30010);
        assert_eq!(frame.regs.a0, 1);
        assert_eq!(cpu.sepc, Some(0x30010));

        let regions: Vec<MappedRegion> = ctx.process.mapped_regions().copied().collect();
        assert_eq!(
            regions,
            vec![
                MappedRegion { va: 0x30000, npages: 1, seg_type: SegmentType::Code },
                MappedRegion { va: 0x31000, npages: 1, seg_type: SegmentType::Data },
            ]
        );
        assert_eq!(ctx.process.pagetable.virt_to_phys(&mem, 0x10000), None);
        // heap pages are gone but the cursor never moves back
        assert_eq!(ctx.process.pagetable.virt_to_phys(&mem, cursor - 1), None);
        assert_eq!(ctx.process.heap.cursor(), cursor);

        let space = ctx.process.space(&mut mem);
        let cell = frame.regs.a1;
        let buf = read_u64(&space, cell);
        let mut text = [0u8; 6];
        copy_from_user(&space, buf, &mut text).unwrap();
        assert_eq!(&text, b"hello\0");
        assert_eq!(fs.open_count(), 0);
    }

    #[test]
    #[should_panic(expected = "failed after teardown")]
    fn load_errors_after_teardown_halt() {
        let mut mem = FlatMemory::new();
        let mut fs = MemFs::new();
        fs.add("/bin/init", program(0x10000, 0x10000));
        fs.add(
            "/bin/bad",
            ElfBuilder::new(0x10000)
                .segment(PF_R | PF_W | PF_X, 0x10000, &[0; 4], 4)
                .build(),
        );
        let mut ctx = booted(&mut mem, &mut fs);
        let path = ArgString::new("/bin/bad").unwrap();
        let arg = ArgString::new("").unwrap();
        let _ = replace_image(&mut ctx, &mut mem, &mut fs, &path, &arg);
    }
}
