//! Bounded set of already-delivered message identifiers
//!
//! Both delivery paths (live and polled) may carry the same envelope. The
//! router consults this set before decrypting so each identifier is emitted
//! at most once while it remains in the window.

use std::collections::{HashSet, VecDeque};

use crate::types::MessageId;

/// Default number of identifiers retained
pub const DEFAULT_SEEN_CAPACITY: usize = 500;

/// Insertion-ordered set that evicts the oldest identifier once full
#[derive(Debug, Clone)]
pub struct SeenMessageSet {
    order: VecDeque<MessageId>,
    members: HashSet<MessageId>,
    capacity: usize,
    evictions: u64,
}

impl SeenMessageSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
            evictions: 0,
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.members.contains(id)
    }

    /// Record an identifier. Returns `false` if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
                self.evictions += 1;
            }
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    pub fn stats(&self) -> SeenSetStats {
        SeenSetStats {
            len: self.order.len(),
            capacity: self.capacity,
            evictions: self.evictions,
        }
    }
}

impl Default for SeenMessageSet {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}

/// Statistics about the seen set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenSetStats {
    pub len: usize,
    pub capacity: usize,
    pub evictions: u64,
}
