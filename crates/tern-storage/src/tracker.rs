use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Hierarchical memory accounting for the ingestion path.
///
/// Writers hold a child tracker parented to the node-wide root; both
/// levels are checked independently so a node-wide overrun throttles every
/// writer, not just the one that tipped it over.
pub struct MemTracker {
    label: String,
    /// Limit in bytes; 0 or negative means unlimited.
    limit: i64,
    consumption: AtomicI64,
    parent: Option<Arc<MemTracker>>,
}

impl MemTracker {
    pub fn root(label: impl Into<String>, limit: i64) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit,
            consumption: AtomicI64::new(0),
            parent: None,
        })
    }

    pub fn child(self: &Arc<Self>, label: impl Into<String>, limit: i64) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit,
            consumption: AtomicI64::new(0),
            parent: Some(Arc::clone(self)),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn parent(&self) -> Option<&Arc<MemTracker>> {
        self.parent.as_ref()
    }

    /// Accounts `bytes` against this tracker and every ancestor.
    pub fn consume(&self, bytes: i64) {
        if bytes == 0 {
            return;
        }
        self.consumption.fetch_add(bytes, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.consume(bytes);
        }
    }

    pub fn release(&self, bytes: i64) {
        self.consume(-bytes);
    }

    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Relaxed)
    }

    pub fn limit_exceeded(&self) -> bool {
        self.limit > 0 && self.consumption() > self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_propagates_to_parent() {
        let root = MemTracker::root("process", 0);
        let child = root.child("writer", 0);

        child.consume(100);
        assert_eq!(child.consumption(), 100);
        assert_eq!(root.consumption(), 100);

        child.release(40);
        assert_eq!(child.consumption(), 60);
        assert_eq!(root.consumption(), 60);
    }

    #[test]
    fn test_limit_exceeded() {
        let root = MemTracker::root("process", 1000);
        let child = root.child("writer", 100);

        child.consume(50);
        assert!(!child.limit_exceeded());
        assert!(!root.limit_exceeded());

        child.consume(60);
        assert!(child.limit_exceeded());
        assert!(!root.limit_exceeded());

        // A sibling can push the parent over even though it is itself
        // under its own limit.
        let sibling = root.child("writer2", 10_000);
        sibling.consume(900);
        assert!(!sibling.limit_exceeded());
        assert!(root.limit_exceeded());
    }

    #[test]
    fn test_unlimited_tracker_never_exceeds() {
        let tracker = MemTracker::root("unlimited", 0);
        tracker.consume(i64::MAX / 2);
        assert!(!tracker.limit_exceeded());
    }
}
