use core::fmt::Write;

/// A UART usable as the kernel console.
pub trait Uart: Write {
    /// Initializes the UART.
    ///
    /// # Safety
    /// The device registers must be mapped at the driver's base address.
    unsafe fn init(&mut self);
    /// Gets an input byte, if any.
    fn get(&mut self) -> Option<u8>;
    /// Writes a byte to the output.
    fn put(&mut self, value: u8);
}
