pub mod cpu;
pub mod mmu;
pub mod trap;
