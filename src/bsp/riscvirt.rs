//! QEMU `virt` machine.

/// NS16550A console.
pub const UART_BASE: usize = 0x1000_0000;

/// Start of RAM. Every process maps this gigabyte for the kernel.
pub const DRAM_BASE: u64 = 0x8000_0000;

/// Harts brought up by the kernel, one process each.
pub const NCPU: usize = 4;

/// Physical page frames handed out to page tables, stacks and user pages.
pub const FRAME_POOL_PAGES: usize = 8192;
