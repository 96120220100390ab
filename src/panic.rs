use crate::{arch::cpu, panic_println};
use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    panic_println!("[!] Kernel Panic: {}", info);
    cpu::wait_forever()
}
