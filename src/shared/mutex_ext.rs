//! Usage: Mutex extension trait that recovers from poisoning instead of propagating panics
//! (the live-attempt table must stay usable after a panicking attempt task).

use std::sync::{Mutex, MutexGuard};

pub(crate) trait MutexExt<T> {
    /// Lock the mutex; on poisoning, log the call site and continue with the inner data.
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[track_caller]
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let loc = std::panic::Location::caller();
                tracing::error!(
                    mutex_type = std::any::type_name::<T>(),
                    file = loc.file(),
                    line = loc.line(),
                    "mutex poisoned by a panicking task; continuing with recovered state"
                );
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn lock_or_recover_returns_guard() {
        let table: Mutex<HashMap<&str, u64>> = Mutex::new(HashMap::new());
        table.lock_or_recover().insert("qwen_code", 1);
        assert_eq!(table.lock_or_recover().get("qwen_code"), Some(&1));
    }

    #[test]
    fn lock_or_recover_survives_poisoning() {
        let table = Arc::new(Mutex::new(HashMap::<&str, u64>::new()));
        let table_clone = Arc::clone(&table);

        let _ = std::thread::spawn(move || {
            let mut guard = table_clone.lock().unwrap();
            guard.insert("iflow", 7);
            panic!("attempt task panicked");
        })
        .join();

        let guard = table.lock_or_recover();
        assert_eq!(guard.get("iflow"), Some(&7));
    }
}
