//! Architecture support. Only RISC-V 64 is targeted; the instruction-level
//! pieces are compiled for `riscv64` alone, the rest also builds on the host.

mod riscv64;

pub use riscv64::{cpu, mmu, trap};
