//! Kernel-global state and the per-hart boot path.

use spin::{Mutex, MutexGuard};

use crate::{
    arch::cpu::Supervisor,
    bsp::{FRAME_POOL_PAGES, NCPU},
    elf,
    fs::FileSystem,
    mmu::{FrameAllocator, Memory, PhysicalMemory},
    physical_page_allocator::PhysicalPageAllocator,
    printk,
    switch::{self, HartContext},
    util::{ErrorExt, UnsafeMutex},
};

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_HART: UnsafeMutex<Option<HartContext>> = UnsafeMutex::new(None);

/// One slot per hart, filled once at boot.
static HARTS: [UnsafeMutex<Option<HartContext>>; NCPU] = [EMPTY_HART; NCPU];

/// Serializes boot so harts load their first program one at a time.
static BOOT_LOCK: Mutex<()> = Mutex::new(());

static FRAMES: Mutex<PhysicalPageAllocator<FRAME_POOL_PAGES>> = Mutex::new(PhysicalPageAllocator::new());

type SharedFs = &'static mut (dyn FileSystem + Send);

static FILESYSTEM: Mutex<Option<SharedFs>> = Mutex::new(None);

/// Hands the frame pool `[start, start + FRAME_POOL_PAGES * PAGE_SIZE)` to the kernel.
///
/// # Safety
/// The range must be unused RAM, identity mapped.
pub unsafe fn init_frames(start: usize) {
    FRAMES.lock().init(start);
}

/// Installs the file system programs are loaded from.
pub fn register_filesystem(fs: SharedFs) {
    *FILESYSTEM.lock() = Some(fs);
}

/// The registered file system. Hold the guard only while using it: it must
/// be dropped before entering user mode.
pub fn filesystem() -> MutexGuard<'static, Option<SharedFs>> {
    FILESYSTEM.lock()
}

/// Borrows `hartid`'s context without locking.
///
/// # Safety
/// Only the hart `hartid` may call this, and only after [`boot_hart`] has
/// filled its slot.
pub unsafe fn hart_context(hartid: usize) -> Option<&'static mut HartContext> {
    HARTS.get(hartid)?.get_mut().as_mut()
}

/// Physical memory as the kernel sees it: identity mapped, frames from
/// the global pool.
pub struct KernelMemory;

impl PhysicalMemory for KernelMemory {
    fn read(&self, pa: u64, buf: &mut [u8]) {
        // Safety: physical memory is identity mapped for the kernel
        unsafe { core::ptr::copy_nonoverlapping(pa as *const u8, buf.as_mut_ptr(), buf.len()) }
    }

    fn write(&mut self, pa: u64, data: &[u8]) {
        // Safety: see `read`
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), pa as *mut u8, data.len()) }
    }
}

impl FrameAllocator for KernelMemory {
    fn alloc_frame(&mut self) -> Option<u64> {
        FRAMES.lock().alloc_frame()
    }

    fn free_frame(&mut self, pa: u64) {
        FRAMES.lock().free_frame(pa)
    }
}

/// Creates `hartid`'s process, loads `path` into it and enters it.
/// Any failure here halts the hart.
pub fn boot_hart<M, C>(hartid: usize, path: &str, mem: &mut M, cpu: &mut C) -> !
where
    M: Memory + ?Sized,
    C: Supervisor + ?Sized,
{
    let slot = HARTS
        .get(hartid)
        .context("hart id out of range")
        .unwrap_or_else(|e| panic!("hart {}: {}", hartid, e));
    {
        let _boot = BOOT_LOCK.lock();
        let mut ctx = HartContext::new(hartid, mem)
            .unwrap_or_else(|e| panic!("hart {}: cannot create process: {}", hartid, e));

        let mut fs = filesystem();
        let fs = match fs.as_mut() {
            Some(fs) => &mut **fs,
            None => panic!("hart {}: no file system registered", hartid),
        };
        printk!("hart {}: loading {}", hartid, path);
        if let Err(e) = elf::load_program(&mut ctx.process, mem, fs, path) {
            panic!("hart {}: cannot load {}: {}", hartid, path, e);
        }
        *slot.lock() = Some(ctx);
    }

    // Safety: this hart owns the slot it just filled
    let ctx = match unsafe { hart_context(hartid) } {
        Some(ctx) => ctx,
        None => unreachable!(),
    };
    switch::switch_to(ctx, cpu)
}
