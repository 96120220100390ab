//! The system calls served by the process core.
//!
//! `a0` carries the call number and `a1`.. its arguments; the result goes
//! back in `a0`.

use crate::{
    exec::{self, ArgString},
    fs::FileSystem,
    mmu::Memory,
    printk,
    switch::HartContext,
    util::{KernelError, KernelResult},
};

pub const SYS_USER_BASE: u64 = 64;
pub const SYS_USER_MALLOC: u64 = SYS_USER_BASE + 2;
pub const SYS_USER_FREE: u64 = SYS_USER_BASE + 3;
pub const SYS_USER_EXEC: u64 = SYS_USER_BASE + 10;

/// Halts the hart on errors that mean kernel state is corrupt, passes
/// everything else through.
fn recoverable<T>(hartid: usize, result: KernelResult<T>) -> KernelResult<T> {
    match result {
        Err(e) if e.is_fatal() => panic!("hart {}: {}", hartid, e),
        other => other,
    }
}

/// Allocates from the process heap. Returns 0 when memory is exhausted.
pub fn sys_user_malloc<M: Memory + ?Sized>(ctx: &mut HartContext, mem: &mut M, size: u64) -> i64 {
    let mut space = ctx.process.space(mem);
    match recoverable(ctx.hartid, ctx.process.heap.allocate(&mut space, size)) {
        Ok(va) => va as i64,
        Err(_) => 0,
    }
}

pub fn sys_user_free<M: Memory + ?Sized>(ctx: &mut HartContext, mem: &mut M, va: u64) -> i64 {
    let mut space = ctx.process.space(mem);
    match recoverable(ctx.hartid, ctx.process.heap.free(&mut space, va)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Copies the path and argument out of the caller and replaces its image.
/// On success `a0` already holds the new image's argument count, so the
/// caller must leave the trap frame alone.
pub fn sys_user_exec<M, F>(ctx: &mut HartContext, mem: &mut M, fs: &mut F, path_va: u64, arg_va: u64) -> KernelResult<()>
where
    M: Memory + ?Sized,
    F: FileSystem + ?Sized,
{
    let (path, arg) = {
        let space = ctx.process.space(mem);
        let path = ArgString::from_user(&space, path_va).map_err(|_| KernelError::BadAddress(path_va))?;
        let arg = ArgString::from_user(&space, arg_va).map_err(|_| KernelError::BadAddress(arg_va))?;
        (path, arg)
    };
    exec::replace_image(ctx, mem, fs, &path, &arg)
}

/// Runs the call described by `args` and stores its result in the trap
/// frame. The caller resumes the process with `switch_to` afterwards.
pub fn do_syscall<M, F>(ctx: &mut HartContext, mem: &mut M, fs: &mut F, args: [u64; 8])
where
    M: Memory + ?Sized,
    F: FileSystem + ?Sized,
{
    let ret = match args[0] {
        SYS_USER_MALLOC => sys_user_malloc(ctx, mem, args[1]),
        SYS_USER_FREE => sys_user_free(ctx, mem, args[1]),
        SYS_USER_EXEC => match sys_user_exec(ctx, mem, fs, args[1], args[2]) {
            Ok(()) => return,
            Err(e) => {
                printk!("hart {}: exec failed: {}", ctx.hartid, e);
                -1
            }
        },
        n => {
            printk!("hart {}: unknown syscall {}", ctx.hartid, n);
            -1
        }
    };
    ctx.process.trapframe.regs.a0 = ret as u64;
}
