//! Entering user mode.

use crate::{
    arch::{
        cpu::{user_return_sstatus, Supervisor},
        trap::TrapFrame,
    },
    mmu::Memory,
    process::Process,
    util::KernelResult,
};

/// What a hart is running: its id and its one process.
pub struct HartContext {
    pub hartid: usize,
    pub process: Process,
    /// Set once the hart has entered its process.
    pub active: bool,
}

impl HartContext {
    pub fn new<M: Memory + ?Sized>(hartid: usize, mem: &mut M) -> KernelResult<Self> {
        Ok(Self {
            hartid,
            process: Process::new(hartid, mem)?,
            active: false,
        })
    }
}

/// Sets up the CSRs and the trap frame for entering `ctx`'s process and
/// returns the frame `return_to_user` restores from.
///
/// # Panics
/// If no image has been loaded into the process.
pub fn prepare<C: Supervisor + ?Sized>(ctx: &mut HartContext, cpu: &mut C) -> *mut TrapFrame {
    assert!(
        ctx.process.is_loaded(),
        "hart {}: switch_to without a loaded process",
        ctx.hartid
    );
    ctx.active = true;

    let entry = cpu.trap_entry();
    cpu.set_stvec(entry.vector);

    // used by the trap vector on the next entry, not by this exit
    let frame = &mut ctx.process.trapframe;
    frame.kernel_sp = ctx.process.kstack;
    frame.kernel_trap = entry.handler;
    frame.kernel_satp = cpu.satp();
    frame.hartid = ctx.hartid as u64;

    let sstatus = user_return_sstatus(cpu.sstatus());
    cpu.set_sstatus(sstatus);
    cpu.set_sepc(frame.epc);
    cpu.set_satp(ctx.process.pagetable.satp());

    frame
}

/// Transfers control to `ctx`'s process. Execution comes back to the kernel
/// only through a trap.
pub fn switch_to<C: Supervisor + ?Sized>(ctx: &mut HartContext, cpu: &mut C) -> ! {
    let frame = prepare(ctx, cpu);
    cpu.return_to_user(frame)
}
