//! Process execution core for a small RISC-V (Sv39) kernel: ELF loading,
//! user-mode entry, exec with one argument, and a per-process user heap.
#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod print;

pub mod arch;
pub mod bsp;
pub mod driver_interfaces;
pub mod drivers;
pub mod elf;
pub mod exec;
pub mod fs;
pub mod heap;
pub mod kernel;
pub mod mmu;
pub mod physical_page_allocator;
pub mod process;
pub mod switch;
pub mod syscall;
pub mod util;

#[cfg(all(not(test), target_os = "none"))]
mod panic;

#[cfg(test)]
mod testing;
