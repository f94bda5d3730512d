//! Poison-tolerant lock helpers.
//!
//! Cache bookkeeping never holds a guard across an await point, so a poisoned
//! lock only means another thread panicked mid-update. The state is still
//! structurally valid and is recovered instead of propagating the panic.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(
    poisoned: PoisonError<G>,
    target: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    warn!(
        op,
        target_module = target,
        lock_kind,
        result = "poisoned_recovered",
        hint = "state may be stale after panic in another thread",
        "Recovered from poisoned cache lock"
    );
    poisoned.into_inner()
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, target, op, "rwlock.read"))
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, target, op, "rwlock.write"))
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, target, op, "mutex.lock"))
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn mutex_recovers_after_panic() {
        let lock = Mutex::new(1);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("lock should be acquired");
            panic!("poison");
        }));

        *mutex_lock(&lock, "test", "write") += 1;
        assert_eq!(*mutex_lock(&lock, "test", "read"), 2);
    }

    #[test]
    fn rwlock_recovers_after_panic() {
        let lock = RwLock::new(String::from("a"));
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("lock should be acquired");
            panic!("poison");
        }));

        rw_write(&lock, "test", "write").push('b');
        assert_eq!(rw_read(&lock, "test", "read").as_str(), "ab");
    }
}
