use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock `lock`, recovering the guard if a previous holder panicked.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned lock"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn recovers_guard_after_panic() {
        let lock = Mutex::new(vec![1]);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("lock should be acquired");
            panic!("poison the lock");
        }));

        mutex_lock(&lock, "util::lock", "test").push(2);
        assert_eq!(*mutex_lock(&lock, "util::lock", "test"), vec![1, 2]);
    }
}
