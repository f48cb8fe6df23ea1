use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if another thread panicked while holding the lock. No lock
///  in this crate is held across user code, so state behind a poisoned lock is still consistent.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock()
        .unwrap_or_else(PoisonError::into_inner)
}
