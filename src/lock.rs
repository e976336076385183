//! Concurrency-control strategies applied per aggregate.
//!
//! A [`LockManager`] is consulted by the handling stage before an aggregate
//! is loaded and by the publication stage before its unit of work commits.
//! Handles are released by the publication stage once the unit of work has
//! reached a terminal state, which may be on a different thread than the
//! one that acquired them.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::CommandError;
use crate::task::partition_for;

/// Proof that a task went through [`LockManager::acquire`].
///
/// Not `Clone`: a handle is handed back to [`LockManager::release`] exactly
/// once.
#[derive(Debug)]
pub struct LockHandle {
    aggregate_id: String,
    expected_version: Option<u64>,
}

impl LockHandle {
    fn new(aggregate_id: &str) -> Self {
        Self {
            aggregate_id: aggregate_id.to_owned(),
            expected_version: None,
        }
    }

    /// The aggregate this handle covers.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Version observed when the aggregate was loaded.
    pub fn expected_version(&self) -> Option<u64> {
        self.expected_version
    }

    /// Record the version the aggregate had at load time.
    pub fn record_version(&mut self, version: Option<u64>) {
        self.expected_version = version;
    }
}

/// Concurrency-control strategy keyed by aggregate identifier.
pub trait LockManager: Send + Sync + 'static {
    /// Obtain a handle for `aggregate_id` before the aggregate is loaded.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::LockTimeout`] if an exclusive lock could not be
    /// obtained within the configured bound.
    fn acquire(&self, aggregate_id: &str) -> Result<LockHandle, CommandError>;

    /// Check, right before commit, that the stream has not moved.
    ///
    /// # Arguments
    ///
    /// * `handle` - The handle recorded at load time.
    /// * `stored_version` - Last stored sequence number of the aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::ConcurrencyConflict`] on a version mismatch.
    fn validate(&self, handle: &LockHandle, stored_version: Option<u64>)
    -> Result<(), CommandError>;

    /// Give the handle back. Called once per acquired handle.
    fn release(&self, handle: LockHandle);
}

/// Which [`LockManager`] a pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingStrategy {
    /// Blocking mutual exclusion per aggregate; waits at most `timeout`.
    Pessimistic {
        /// Upper bound on how long the handling stage waits for a lock.
        timeout: Duration,
    },
    /// Non-blocking; conflicts are detected when committing.
    Optimistic,
}

impl Default for LockingStrategy {
    fn default() -> Self {
        LockingStrategy::Pessimistic {
            timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl LockingStrategy {
    /// Instantiate the strategy with `segments` lock-table partitions.
    pub(crate) fn build(self, segments: usize) -> Arc<dyn LockManager> {
        match self {
            LockingStrategy::Pessimistic { timeout } => {
                Arc::new(PessimisticLockManager::new(timeout, segments))
            }
            LockingStrategy::Optimistic => Arc::new(OptimisticLockManager),
        }
    }
}

/// Default wait bound for pessimistic locks.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// One slice of the pessimistic lock table.
#[derive(Debug, Default)]
struct LockSegment {
    held: Mutex<HashSet<String>>,
    freed: Condvar,
}

/// Exclusive per-aggregate locks with a bounded wait.
///
/// The lock table is split into segments using the same hash as publication
/// partitions, so contention on one aggregate never touches the slice that
/// holds another partition's aggregates.
#[derive(Debug)]
pub struct PessimisticLockManager {
    segments: Vec<LockSegment>,
    timeout: Duration,
}

impl PessimisticLockManager {
    /// Create a lock manager.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time [`acquire`](LockManager::acquire) blocks.
    /// * `segments` - Number of lock-table slices (at least one is used).
    pub fn new(timeout: Duration, segments: usize) -> Self {
        let segments = (0..segments.max(1)).map(|_| LockSegment::default()).collect();
        Self { segments, timeout }
    }

    fn segment(&self, aggregate_id: &str) -> &LockSegment {
        &self.segments[partition_for(aggregate_id, self.segments.len())]
    }

    /// Whether some task currently holds the lock for `aggregate_id`.
    pub fn is_locked(&self, aggregate_id: &str) -> bool {
        let held = self
            .segment(aggregate_id)
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.contains(aggregate_id)
    }
}

impl LockManager for PessimisticLockManager {
    fn acquire(&self, aggregate_id: &str) -> Result<LockHandle, CommandError> {
        let segment = self.segment(aggregate_id);
        let deadline = Instant::now() + self.timeout;
        let mut held = segment.held.lock().unwrap_or_else(PoisonError::into_inner);

        while held.contains(aggregate_id) {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    timeout = ?self.timeout,
                    "lock acquisition timed out"
                );
                return Err(CommandError::LockTimeout {
                    aggregate_id: aggregate_id.to_owned(),
                    timeout: self.timeout,
                });
            }
            let (guard, _) = segment
                .freed
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            held = guard;
        }

        held.insert(aggregate_id.to_owned());
        Ok(LockHandle::new(aggregate_id))
    }

    fn validate(
        &self,
        _handle: &LockHandle,
        _stored_version: Option<u64>,
    ) -> Result<(), CommandError> {
        // Exclusive access: nobody else could have appended.
        Ok(())
    }

    fn release(&self, handle: LockHandle) {
        let segment = self.segment(&handle.aggregate_id);
        let mut held = segment.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.remove(&handle.aggregate_id) {
            tracing::warn!(
                aggregate_id = %handle.aggregate_id,
                "released a lock that was not held"
            );
        }
        drop(held);
        segment.freed.notify_all();
    }
}

/// Version-checked, non-blocking strategy.
///
/// [`acquire`](LockManager::acquire) never waits; the version recorded at
/// load time is compared with the store right before commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct OptimisticLockManager;

impl LockManager for OptimisticLockManager {
    fn acquire(&self, aggregate_id: &str) -> Result<LockHandle, CommandError> {
        Ok(LockHandle::new(aggregate_id))
    }

    fn validate(&self, handle: &LockHandle, stored_version: Option<u64>) -> Result<(), CommandError> {
        if handle.expected_version == stored_version {
            return Ok(());
        }
        tracing::warn!(
            aggregate_id = %handle.aggregate_id,
            expected = ?handle.expected_version,
            actual = ?stored_version,
            "optimistic concurrency conflict"
        );
        Err(CommandError::ConcurrencyConflict {
            aggregate_id: handle.aggregate_id.clone(),
            expected: handle.expected_version,
            actual: stored_version,
        })
    }

    fn release(&self, _handle: LockHandle) {}
}
