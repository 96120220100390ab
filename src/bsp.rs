mod riscvirt;

pub use riscvirt::*;
