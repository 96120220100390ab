use core::mem::offset_of;

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(include_str!("trap.S"));

/// General purpose registers saved across a trap, `zero` excluded.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Regs {
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

impl Regs {
    pub const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            gp: 0,
            tp: 0,
            t0: 0,
            t1: 0,
            t2: 0,
            s0: 0,
            s1: 0,
            a0: 0,
            a1: 0,
            a2: 0,
            a3: 0,
            a4: 0,
            a5: 0,
            a6: 0,
            a7: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
            t3: 0,
            t4: 0,
            t5: 0,
            t6: 0,
        }
    }

    /// Syscall arguments as passed in a0..a7.
    pub fn syscall_args(&self) -> [u64; 8] {
        [
            self.a0, self.a1, self.a2, self.a3, self.a4, self.a5, self.a6, self.a7,
        ]
    }
}

/// Per-process state saved on trap entry and restored by `return_to_user`.
///
/// `trap.S` addresses every field by its byte offset; the asserts below keep
/// this struct and the assembly in agreement.
#[repr(C)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: Regs,
    /// Top of the process's kernel stack.
    pub kernel_sp: u64,
    /// Address of `smode_trap_handler`.
    pub kernel_trap: u64,
    /// User pc to resume at.
    pub epc: u64,
    /// Kernel page table token, restored on trap entry.
    pub kernel_satp: u64,
    pub hartid: u64,
}

impl TrapFrame {
    pub const fn new() -> Self {
        Self {
            regs: Regs::zeroed(),
            kernel_sp: 0,
            kernel_trap: 0,
            epc: 0,
            kernel_satp: 0,
            hartid: 0,
        }
    }
}

const _: () = assert!(core::mem::size_of::<Regs>() == 31 * 8);
const _: () = assert!(offset_of!(Regs, sp) == 8);
const _: () = assert!(offset_of!(Regs, a0) == 72);
const _: () = assert!(offset_of!(TrapFrame, regs) == 0);
const _: () = assert!(offset_of!(TrapFrame, kernel_sp) == 248);
const _: () = assert!(offset_of!(TrapFrame, kernel_trap) == 256);
const _: () = assert!(offset_of!(TrapFrame, epc) == 264);
const _: () = assert!(offset_of!(TrapFrame, kernel_satp) == 272);
const _: () = assert!(offset_of!(TrapFrame, hartid) == 280);

/// Exception code for an environment call from U-mode.
pub const CAUSE_USER_ECALL: u64 = 8;

/// Entered from `smode_trap_vector` on the process's kernel stack with the
/// kernel page table installed. Never returns; user execution resumes through
/// another `switch_to`.
#[cfg(target_arch = "riscv64")]
#[no_mangle]
pub extern "C" fn smode_trap_handler() -> ! {
    use super::cpu::{self, Hart};
    use crate::{kernel, printk, switch, syscall};

    let hartid = cpu::hartid();
    // Safety: only this hart touches its slot after boot.
    let ctx = match unsafe { kernel::hart_context(hartid) } {
        Some(ctx) => ctx,
        None => panic!("hart {} trapped without a process", hartid),
    };
    ctx.process.trapframe.epc = cpu::sepc();

    let cause = cpu::scause();
    let is_async = cause >> 63 & 1 == 1;
    let cause_num = cause & 0xfff;
    if is_async || cause_num != CAUSE_USER_ECALL {
        printk!(
            "hart {}: unexpected trap cause={} epc=0x{:x} tval=0x{:x}",
            hartid,
            cause,
            ctx.process.trapframe.epc,
            cpu::stval()
        );
        panic!("unexpected trap from user mode");
    }

    // resume after the ecall
    ctx.process.trapframe.epc += 4;
    let args = ctx.process.trapframe.regs.syscall_args();
    {
        let mut fs = kernel::filesystem();
        let fs = match fs.as_mut() {
            Some(fs) => &mut **fs,
            None => panic!("hart {}: no file system registered", hartid),
        };
        syscall::do_syscall(ctx, &mut kernel::KernelMemory, fs, args);
    }

    let mut hart = Hart;
    switch::switch_to(ctx, &mut hart)
}
