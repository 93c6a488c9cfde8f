use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier embedded in every outgoing message and matched on delivery
pub type MessageId = u64;

/// Identifier assigned to each send task, used for attribution only
pub type ConnectionId = u64;

/// Lock-free generator of unique, strictly increasing identifiers.
///
/// Shared by every send task of a run. Values start at the configured base and
/// are never handed out twice; concurrent callers may observe gaps relative to
/// each other but each caller sees its own values strictly increase.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }

    /// Reserve the next identifier
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of identifiers handed out so far, relative to `base`
    pub fn issued_since(&self, base: u64) -> u64 {
        self.next.load(Ordering::Relaxed).saturating_sub(base)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}
