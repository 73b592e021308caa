//! Active operation registry
//!
//! Maps an operation id to its in-flight bookkeeping. The registry is the
//! only arbiter of id uniqueness: `register` is an atomic check-and-insert,
//! and a colliding registration is rejected with `AlreadyRegistered`, which
//! hands back both the entry that won and the value that lost.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use proven_common::OperationId;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Callback fired once when an operation completes
pub type CompletionCallback = Box<dyn FnOnce(OperationId) + Send>;

/// Live bookkeeping record for one in-flight operation id
pub struct ActiveOperation<T> {
    id: OperationId,
    attachment: T,
    completed: AtomicBool,
    on_complete: Mutex<Option<CompletionCallback>>,
    registry: Weak<DashMap<OperationId, Arc<ActiveOperation<T>>>>,
}

impl<T> ActiveOperation<T> {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// The state registered with this operation
    pub fn attachment(&self) -> &T {
        &self.attachment
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Remove the operation from its registry and fire the completion callback
    ///
    /// Only the first call has any effect; it returns `true`.
    pub fn complete(&self) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(entries) = self.registry.upgrade() {
            entries.remove_if(&self.id, |_, entry| std::ptr::eq(Arc::as_ptr(entry), self));
        }

        let callback = self.on_complete.lock().take();
        if let Some(callback) = callback {
            callback(self.id);
        }
        true
    }
}

impl<T> fmt::Debug for ActiveOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveOperation")
            .field("id", &self.id)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Rejected registration: an operation with the same id already exists
#[derive(Error)]
#[error("Operation {} is already registered", .existing.id)]
pub struct AlreadyRegistered<T> {
    /// The registration that is already in place
    pub existing: Arc<ActiveOperation<T>>,
    /// The state that was not registered
    pub rejected: T,
}

impl<T> fmt::Debug for AlreadyRegistered<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlreadyRegistered")
            .field("id", &self.existing.id)
            .finish()
    }
}

/// Registry of active operations for one side of a connection
pub struct ActiveOperationRegistry<T> {
    entries: Arc<DashMap<OperationId, Arc<ActiveOperation<T>>>>,
    next_id: AtomicU32,
}

impl<T> ActiveOperationRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate the next locally initiated operation id
    pub fn next_id(&self) -> OperationId {
        OperationId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register an operation under `id` unless one already exists
    pub fn register(
        &self,
        id: OperationId,
        attachment: T,
        on_complete: Option<CompletionCallback>,
    ) -> Result<Arc<ActiveOperation<T>>, AlreadyRegistered<T>> {
        match self.entries.entry(id) {
            Entry::Occupied(existing) => Err(AlreadyRegistered {
                existing: existing.get().clone(),
                rejected: attachment,
            }),
            Entry::Vacant(vacant) => {
                let operation = Arc::new(ActiveOperation {
                    id,
                    attachment,
                    completed: AtomicBool::new(false),
                    on_complete: Mutex::new(on_complete),
                    registry: Arc::downgrade(&self.entries),
                });
                vacant.insert(operation.clone());
                Ok(operation)
            }
        }
    }

    pub fn lookup(&self, id: OperationId) -> Option<Arc<ActiveOperation<T>>> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: OperationId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every registered operation
    pub fn operations(&self) -> Vec<Arc<ActiveOperation<T>>> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Remove every registered operation without firing callbacks
    pub fn drain(&self) -> Vec<Arc<ActiveOperation<T>>> {
        let ids: Vec<OperationId> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|(_, op)| op))
            .collect()
    }
}

impl<T> Default for ActiveOperationRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = ActiveOperationRegistry::new();
        let id = OperationId::new(5);

        let first = registry.register(id, "first", None).unwrap();
        let err = registry.register(id, "second", None).unwrap_err();

        assert_eq!(err.rejected, "second");
        assert_eq!(err.to_string(), "Operation 5 is already registered");
        assert!(Arc::ptr_eq(&err.existing, &first));
        assert_eq!(*registry.lookup(id).unwrap().attachment(), "first");
    }

    #[test]
    fn test_complete_removes_and_fires_once() {
        let registry = ActiveOperationRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        let op = registry
            .register(
                registry.next_id(),
                (),
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        assert!(registry.contains(op.id()));
        assert!(op.complete());
        assert!(!op.complete());
        assert!(!registry.contains(op.id()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_complete_does_not_remove_a_replacement() {
        let registry = ActiveOperationRegistry::new();
        let id = OperationId::new(1);

        let stale = registry.register(id, 1, None).unwrap();
        registry.drain();
        let fresh = registry.register(id, 2, None).unwrap();

        stale.complete();
        assert!(Arc::ptr_eq(&registry.lookup(id).unwrap(), &fresh));
    }

    #[test]
    fn test_concurrent_registration_admits_exactly_one() {
        let registry = Arc::new(ActiveOperationRegistry::new());
        let barrier = Arc::new(Barrier::new(8));
        let id = OperationId::new(99);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.register(id, i, None).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let registry: ActiveOperationRegistry<()> = ActiveOperationRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert!(a < b);
    }
}
