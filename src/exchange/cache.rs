// =============================================================================
// Short-TTL cache for balance and positions
// =============================================================================
//
// Any state-changing exchange call (open/close/partial/stop/take/cancel)
// must invalidate both caches before returning, whether it succeeds or
// fails — handled by each adapter calling `invalidate()` in a `finally`-
// style guard around the call.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::RwLock;

const DEFAULT_TTL: Duration = Duration::from_secs(15);

/// A single cached value with an age check, guarded by a read-write lock so
/// concurrent reads never block each other.
pub struct TtlCache<T: Clone> {
    ttl: Duration,
    slot: RwLock<Option<(Instant, T)>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            slot: RwLock::new(None),
        }
    }

    /// Return the cached value if present and younger than the TTL.
    pub fn get(&self) -> Option<T> {
        let guard = self.slot.read();
        match &*guard {
            Some((at, value)) if at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn set(&self, value: T) {
        *self.slot.write() = Some((Instant::now(), value));
    }

    pub fn invalidate(&self) {
        *self.slot.write() = None;
    }
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_misses() {
        let cache: TtlCache<u32> = TtlCache::new();
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn set_then_get_hits() {
        let cache = TtlCache::new();
        cache.set(42u32);
        assert_eq!(cache.get(), Some(42));
    }

    #[test]
    fn invalidate_clears_the_slot() {
        let cache = TtlCache::new();
        cache.set(42u32);
        cache.invalidate();
        assert_eq!(cache.get(), None);
    }
}
