use core::{cell::UnsafeCell, ops::Deref};

use spin::Mutex;

pub mod error;

pub use error::{ErrorExt, KernelError, KernelResult};

/// A Mutex wrapper that allows it
/// (in some cases) to be borrowed without locking.
///
/// Used for per-hart slots: other harts only touch a slot while holding the
/// lock during boot, the owning hart borrows it lock-free afterwards.
pub struct UnsafeMutex<T>(UnsafeCell<Mutex<T>>);

impl<T> Deref for UnsafeMutex<T> {
    type Target = Mutex<T>;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.0.get() }
    }
}

impl<T> UnsafeMutex<T> {
    pub const fn new(val: T) -> Self {
        Self(UnsafeCell::new(Mutex::new(val)))
    }

    /// Borrows this Mutex's value, mutably, without locking.
    ///
    /// # Safety
    /// You **must ensure** there are no other references
    /// before using this function. Since it does not lock,
    /// it cannot check whether it is already in use.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        (*self.0.get()).get_mut()
    }
}

unsafe impl<T: Send> Sync for UnsafeMutex<T> {}
unsafe impl<T: Send> Send for UnsafeMutex<T> {}

/// Rounds `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    align_down(value + align - 1, align)
}

/// [`align_up`] that returns `None` instead of wrapping past `u64::MAX`.
#[inline]
pub const fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(v) => Some(align_down(v, align)),
        None => None,
    }
}
