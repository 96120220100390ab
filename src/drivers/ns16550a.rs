use crate::driver_interfaces::Uart;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};
use tock_registers::{register_bitfields, register_structs};

register_bitfields! {
    u8,
    // Interrupt Enable Register
    IER [
        // Received data available
        RDA OFFSET(0) NUMBITS(1) []
    ],
    // FIFO Control Register
    FCR [
        FIFO_ENABLE OFFSET(0) NUMBITS(1) []
    ],
    // Line Control Register
    LCR [
        WORD_LENGTH OFFSET(0) NUMBITS(2) [
            FiveBits = 0b00,
            SixBits = 0b01,
            SevenBits = 0b10,
            EightBits = 0b11
        ],
        // Divisor Latch Access Bit, RBR_THR/IER become the divisor while set
        DLAB OFFSET(7) NUMBITS(1) []
    ],
    // Line Status Register
    LSR [
        // Data ready
        DR OFFSET(0) NUMBITS(1) [],
        // Transmit holding register empty
        THRE OFFSET(5) NUMBITS(1) []
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub RegisterBlock {
        (0x00 => RBR_THR: ReadWrite<u8>),
        (0x01 => IER: ReadWrite<u8, IER::Register>),
        (0x02 => FCR: WriteOnly<u8, FCR::Register>),
        (0x03 => LCR: ReadWrite<u8, LCR::Register>),
        (0x04 => _reserved0),
        (0x05 => LSR: ReadOnly<u8, LSR::Register>),
        (0x06 => @END),
    }
}

/// The QEMU `virt` board's 16550-compatible UART.
pub struct Ns16550a {
    base_address: usize,
}

impl Ns16550a {
    /// # Safety
    /// `base_address` must be the MMIO base of an NS16550A.
    pub const unsafe fn new(base_address: usize) -> Self {
        Self { base_address }
    }

    fn regs(&self) -> &RegisterBlock {
        // Safety: guaranteed by the caller of `new`
        unsafe { &*(self.base_address as *const RegisterBlock) }
    }
}

impl core::fmt::Write for Ns16550a {
    fn write_str(&mut self, s: &str) -> Result<(), core::fmt::Error> {
        for c in s.bytes() {
            self.put(c);
        }
        Ok(())
    }
}

impl Uart for Ns16550a {
    unsafe fn init(&mut self) {
        let regs = self.regs();
        regs.LCR.write(LCR::WORD_LENGTH::EightBits);
        regs.FCR.write(FCR::FIFO_ENABLE::SET);
        regs.IER.write(IER::RDA::SET);
        // the divisor does nothing under qemu but real parts want one
        let divisor = 592u16;
        regs.LCR.write(LCR::WORD_LENGTH::EightBits + LCR::DLAB::SET);
        regs.RBR_THR.set((divisor & 0xff) as u8);
        regs.IER.set((divisor >> 8) as u8);
        regs.LCR.write(LCR::WORD_LENGTH::EightBits);
    }

    fn get(&mut self) -> Option<u8> {
        let regs = self.regs();
        match regs.LSR.is_set(LSR::DR) {
            true => Some(regs.RBR_THR.get()),
            false => None,
        }
    }

    fn put(&mut self, value: u8) {
        let regs = self.regs();
        while !regs.LSR.is_set(LSR::THRE) {
            core::hint::spin_loop();
        }
        regs.RBR_THR.set(value);
    }
}
