//! Synchronization primitives
//!
//! Busy-waiting locks for code running on several physical cores with no
//! scheduler underneath. Every lock in the core is one of these.

/// Spinning mutual-exclusion lock
pub type SpinLock<T> = spin::Mutex<T>;

/// Guard of a held [`SpinLock`]
pub type SpinLockGuard<'a, T> = spin::MutexGuard<'a, T>;
