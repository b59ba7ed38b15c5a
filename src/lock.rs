use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The state behind these mutexes is only ever touched in short synchronous
/// sections that never hold the guard across an `.await`. A panic inside one
/// of those sections leaves at worst a stale entry, which later operations
/// tolerate, so the poison flag carries no information worth propagating.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
