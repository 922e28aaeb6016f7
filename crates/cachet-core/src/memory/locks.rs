//! Striped per-key locks.

use std::hash::{BuildHasher, RandomState};

use parking_lot::{Mutex, MutexGuard};

pub(crate) const DEFAULT_STRIPES: usize = 64;

/// A fixed set of mutexes addressed by key hash.
///
/// Holding the stripe of a key serializes every mutation of that key's item
/// and its dependency links. The lock never spans I/O or an `.await`.
pub(crate) struct KeyLocks {
    stripes: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl KeyLocks {
    pub(crate) fn with_stripes(count: usize) -> Self {
        let stripes = (0..count.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            stripes,
            hasher: RandomState::new(),
        }
    }

    pub(crate) fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let index = (self.hasher.hash_one(key) as usize) % self.stripes.len();
        self.stripes[index].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_can_be_reacquired_after_release() {
        let locks = KeyLocks::with_stripes(1024);
        let a = locks.lock("a");
        drop(a);
        let _b = locks.lock("a");
    }

    #[test]
    fn test_zero_stripes_falls_back_to_one() {
        let locks = KeyLocks::with_stripes(0);
        let _guard = locks.lock("anything");
    }
}
