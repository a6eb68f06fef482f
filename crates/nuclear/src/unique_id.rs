use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// A process-wide unique ID.
///
/// Used for reaction ids, task ids, and anywhere else the kernel needs an
/// opaque, monotonically increasing 64-bit handle. The underlying
/// implementation is a single atomic counter, and the ID contains a niche,
/// meaning `Option<UniqueId>` is never bigger than the struct.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct UniqueId(NonZeroU64);

impl UniqueId {
    pub fn new() -> UniqueId {
        UniqueId(unique_u64())
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        UniqueId::new()
    }
}

/// Return a process-wide unique, monotonically increasing u64.
fn unique_u64() -> NonZeroU64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let got = COUNTER.fetch_add(1, Ordering::Relaxed);
    NonZeroU64::new(got + 1).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_u64() {
        assert_eq!(unique_u64().get(), 1);
        assert_eq!(unique_u64().get(), 2);
        assert_eq!(unique_u64().get(), 3);
    }
}
