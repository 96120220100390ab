use tock_registers::interfaces::{ReadWriteable, Readable};
use tock_registers::{register_bitfields, registers::InMemoryRegister};

use super::trap::TrapFrame;

register_bitfields! {
    u64,
    // Supervisor status register, only the bits the user return path touches
    SSTATUS [
        // interrupts enabled in S-mode
        SIE OFFSET(1) NUMBITS(1) [],
        // interrupt enable restored by sret
        SPIE OFFSET(5) NUMBITS(1) [],
        // privilege sret returns to
        SPP OFFSET(8) NUMBITS(1) [
            User = 0,
            Supervisor = 1
        ],
        // S-mode may access U pages
        SUM OFFSET(18) NUMBITS(1) []
    ]
}

/// Computes the `sstatus` value for an `sret` into user mode: previous
/// privilege is U and interrupts come back on once the return completes.
pub fn user_return_sstatus(sstatus: u64) -> u64 {
    let reg: InMemoryRegister<u64, SSTATUS::Register> = InMemoryRegister::new(sstatus);
    reg.modify(SSTATUS::SPP::User + SSTATUS::SPIE::SET);
    reg.get()
}

/// Addresses of the kernel's trap entry points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapEntry {
    /// Written to `stvec`; saves user state into the trap frame.
    pub vector: u64,
    /// Rust handler the vector jumps to after switching to the kernel stack.
    pub handler: u64,
}

/// The supervisor-level CSR operations needed to enter user mode.
///
/// `return_to_user` is the one-way transition; everything before it only
/// edits machine state and can be exercised without leaving the kernel.
pub trait Supervisor {
    fn trap_entry(&self) -> TrapEntry;

    fn set_stvec(&mut self, addr: u64);

    fn sstatus(&self) -> u64;

    fn set_sstatus(&mut self, value: u64);

    fn set_sepc(&mut self, pc: u64);

    /// The currently installed page table token.
    fn satp(&self) -> u64;

    /// Installs a page table token and flushes the TLB.
    fn set_satp(&mut self, value: u64);

    /// Restores the frame's registers and executes `sret`.
    fn return_to_user(&mut self, frame: *mut TrapFrame) -> !;
}

#[cfg(target_arch = "riscv64")]
#[inline(always)]
pub fn wait_forever() -> ! {
    // Safety: Never returns
    unsafe {
        loop {
            #[rustfmt::skip]
            core::arch::asm!(
                "wfi",
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub fn wait_forever() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(target_arch = "riscv64")]
pub use self::hart::*;

#[cfg(target_arch = "riscv64")]
mod hart {
    use core::arch::asm;

    use super::{Supervisor, TrapEntry};
    use crate::arch::trap::TrapFrame;

    extern "C" {
        fn smode_trap_vector();
        fn return_to_user(frame: *mut TrapFrame) -> !;
    }

    /// The hart this code is running on. The kernel keeps its id in `tp`.
    #[inline(always)]
    pub fn hartid() -> usize {
        let id: usize;
        unsafe { asm!("mv {0}, tp", out(reg) id) };
        id
    }

    pub fn scause() -> u64 {
        let value: u64;
        unsafe { asm!("csrr {0}, scause", out(reg) value) };
        value
    }

    pub fn sepc() -> u64 {
        let value: u64;
        unsafe { asm!("csrr {0}, sepc", out(reg) value) };
        value
    }

    pub fn stval() -> u64 {
        let value: u64;
        unsafe { asm!("csrr {0}, stval", out(reg) value) };
        value
    }

    /// The executing hart's supervisor CSRs.
    pub struct Hart;

    impl Supervisor for Hart {
        fn trap_entry(&self) -> TrapEntry {
            TrapEntry {
                vector: smode_trap_vector as usize as u64,
                handler: crate::arch::trap::smode_trap_handler as usize as u64,
            }
        }

        fn set_stvec(&mut self, addr: u64) {
            unsafe { asm!("csrw stvec, {0}", in(reg) addr) };
        }

        fn sstatus(&self) -> u64 {
            let value: u64;
            unsafe { asm!("csrr {0}, sstatus", out(reg) value) };
            value
        }

        fn set_sstatus(&mut self, value: u64) {
            unsafe { asm!("csrw sstatus, {0}", in(reg) value) };
        }

        fn set_sepc(&mut self, pc: u64) {
            unsafe { asm!("csrw sepc, {0}", in(reg) pc) };
        }

        fn satp(&self) -> u64 {
            let value: u64;
            unsafe { asm!("csrr {0}, satp", out(reg) value) };
            value
        }

        fn set_satp(&mut self, value: u64) {
            unsafe {
                asm!("csrw satp, {0}", in(reg) value);
                asm!("sfence.vma");
            }
        }

        fn return_to_user(&mut self, frame: *mut TrapFrame) -> ! {
            // Safety: the frame belongs to the process whose satp was just
            // installed, and the kernel gigapage keeps it reachable.
            unsafe { return_to_user(frame) }
        }
    }
}
