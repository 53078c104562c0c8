#![no_std]

mod spin_mutex;

pub use spin_mutex::{SpinMutex, SpinMutexGuard};

/// Low-level support hooks for a mutex flavor.
///
/// A `MutexSupport` implementation decides what happens around the critical
/// section, e.g. nothing for a plain spin lock, or masking interrupts for a
/// lock that may be taken from interrupt context.
pub trait MutexSupport {
    /// Guard data kept while the lock is held.
    type GuardData;
    /// Called before acquiring the lock.
    fn before_lock() -> Self::GuardData;
    /// Called after the lock is released.
    fn after_unlock(_: &mut Self::GuardData);
}

/// Plain spinning with no side effects around the critical section.
#[derive(Debug)]
pub struct Spin;

impl MutexSupport for Spin {
    type GuardData = ();
    #[inline(always)]
    fn before_lock() -> Self::GuardData {}
    #[inline(always)]
    fn after_unlock(_: &mut Self::GuardData) {}
}

/// The spin lock used throughout the kernel.
///
/// The guard is deliberately neither `Send` nor `Sync`, so it cannot be held
/// across a suspension point.
pub type SpinLock<T> = SpinMutex<T, Spin>;
