use core::fmt;

use spin::Mutex;

use crate::driver_interfaces::Uart;
use crate::drivers::ns16550a::Ns16550a;

/// The log sink. Output is dropped until [`init_console`] installs a UART.
pub static CONSOLE: Mutex<Option<Ns16550a>> = Mutex::new(None);

/// Initializes the UART at `base` and routes all printing to it.
///
/// # Safety
/// `base` must be the MMIO base of an NS16550A.
pub unsafe fn init_console(base: usize) {
    let mut uart = Ns16550a::new(base);
    uart.init();
    *CONSOLE.lock() = Some(uart);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    if let Some(uart) = CONSOLE.lock().as_mut() {
        let _ = uart.write_fmt(args);
    }
}

/// # Safety
/// Breaks the console lock; only for the panic path.
#[doc(hidden)]
pub unsafe fn _panic_print(args: fmt::Arguments) {
    CONSOLE.force_unlock();
    _print(args)
}

/// See [std::print].
#[macro_export]
macro_rules! print {
	($($args:tt)+) => ({
		$crate::print::_print(format_args!($($args)+))
	});
}

/// See [std::println].
#[macro_export]
macro_rules! println {
	() => ({
		$crate::print!("\r\n")
	});
	($fmt:expr) => ({
		$crate::print!(concat!($fmt, "\r\n"))
	});
	($fmt:expr, $($args:tt)+) => ({
		$crate::print!(concat!($fmt, "\r\n"), $($args)+)
	});
}

/// Like [print!], but steals the console lock from whoever holds it.
#[macro_export]
macro_rules! panic_print {
	($($args:tt)+) => ({
		#[allow(unused_unsafe)]
		// Safety: !! UNSAFE !! only reached while panicking
		unsafe {
			$crate::print::_panic_print(format_args!($($args)+))
		}
	});
}

/// See [std::println].
/// # Safety
/// Safe only to call once.
#[macro_export]
macro_rules! panic_println {
	() => ({
		$crate::panic_print!("\r\n")
	});
	($fmt:expr) => ({
		$crate::panic_print!(concat!($fmt, "\r\n"))
	});
	($fmt:expr, $($args:tt)+) => ({
		$crate::panic_print!(concat!($fmt, "\r\n"), $($args)+)
	});
}

/// Similar to [std::println] but tags the line as a kernel message.
#[macro_export]
macro_rules! printk {
	($fmt:expr) => ({
		$crate::println!(concat!("[kernel] ", $fmt))
	});
	($fmt:expr, $($args:tt)+) => ({
		$crate::println!(concat!("[kernel] ", $fmt), $($args)+)
	});
}
