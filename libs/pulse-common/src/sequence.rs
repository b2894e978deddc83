use std::sync::atomic::{AtomicU64, Ordering};

use crate::id::prefix;

/// Monotonic, human-readable connection id allocator (`conn-1`, `conn-2`, ...).
///
/// Ids are never reused for the lifetime of the generator, so a reconnecting
/// client always receives a fresh id.
pub struct ConnectionIdGenerator {
    next: AtomicU64,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn generate(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", prefix::CONNECTION, n)
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
