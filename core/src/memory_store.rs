//! In-process store with connection-scoped locks.
//!
//! [`MemoryStore`] plays the server; each [`MemorySession`] is one
//! connection with its own numeric id. Locks follow the same rules as a SQL
//! server's named locks: a blocking acquire with a timeout, re-entrant for
//! the holding connection, and dropped automatically when the connection
//! goes away. Every grant and release is logged with a `tokio` timestamp so
//! tests can check ordering under a paused clock.
//!
//! Faults can be armed per primitive to exercise error paths.

use crate::category::Category;
use crate::errors::StoreError;
use crate::store::{
    DatasetRevision, Ledger, LockAttempt, LockHolderId, LockStore, SupportedDataset, TrackingRecord,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Primitive a fault can be armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFault {
    Acquire,
    Release,
    CurrentHolder,
    SessionId,
    Insert,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEventKind {
    Granted,
    Released,
}

/// A lock state change observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEvent {
    pub name: String,
    pub connection: u64,
    pub kind: LockEventKind,
    pub at: Instant,
}

#[derive(Default)]
struct State {
    locks: HashMap<String, u64>,
    records: Vec<TrackingRecord>,
    datasets: Vec<SupportedDataset>,
    events: Vec<LockEvent>,
    faults: HashMap<MemoryFault, usize>,
}

struct Shared {
    instance_id: String,
    next_connection: AtomicU64,
    state: Mutex<State>,
    released: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trip(&self, fault: MemoryFault) -> Result<(), StoreError> {
        let mut state = self.state();
        match state.faults.get_mut(&fault) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Unavailable(format!("injected {fault:?} fault")))
            }
            _ => Ok(()),
        }
    }

    fn try_take(&self, name: &str, connection: u64) -> bool {
        let mut state = self.state();
        match state.locks.get(name) {
            Some(holder) if *holder == connection => true,
            Some(_) => false,
            None => {
                state.locks.insert(name.to_string(), connection);
                state.events.push(LockEvent {
                    name: name.to_string(),
                    connection,
                    kind: LockEventKind::Granted,
                    at: Instant::now(),
                });
                true
            }
        }
    }

    fn give_back(&self, name: &str, connection: u64) -> bool {
        let released = {
            let mut state = self.state();
            if state.locks.get(name) == Some(&connection) {
                state.locks.remove(name);
                state.events.push(LockEvent {
                    name: name.to_string(),
                    connection,
                    kind: LockEventKind::Released,
                    at: Instant::now(),
                });
                true
            } else {
                false
            }
        };
        if released {
            self.released.notify_waiters();
        }
        released
    }

    fn end_session(&self, connection: u64) {
        let held: Vec<String> = self
            .state()
            .locks
            .iter()
            .filter(|(_, holder)| **holder == connection)
            .map(|(name, _)| name.clone())
            .collect();
        for name in held {
            tracing::debug!(lock = %name, connection, "Session ended, releasing lock");
            self.give_back(&name, connection);
        }
    }
}

/// Shared in-process backend.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                instance_id: instance_id.into(),
                next_connection: AtomicU64::new(1),
                state: Mutex::new(State::default()),
                released: Notify::new(),
            }),
        }
    }

    /// Open a new connection.
    pub fn connect(&self) -> MemorySession {
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        MemorySession {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Make the next `times` calls of `fault`'s primitive fail.
    pub fn inject_fault(&self, fault: MemoryFault, times: usize) {
        *self.shared.state().faults.entry(fault).or_default() += times;
    }

    pub fn held_lock_count(&self) -> usize {
        self.shared.state().locks.len()
    }

    /// Connection currently holding `name`.
    pub fn holder_of(&self, name: &str) -> Option<u64> {
        self.shared.state().locks.get(name).copied()
    }

    pub fn events(&self) -> Vec<LockEvent> {
        self.shared.state().events.clone()
    }

    /// Ledger content in insertion order.
    pub fn tracking_records(&self) -> Vec<TrackingRecord> {
        self.shared.state().records.clone()
    }
}

/// One connection to a [`MemoryStore`]; its locks die with it.
pub struct MemorySession {
    id: u64,
    shared: Arc<Shared>,
}

impl MemorySession {
    pub fn connection_id(&self) -> u64 {
        self.id
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.shared.end_session(self.id);
    }
}

#[async_trait]
impl LockStore for MemorySession {
    fn instance_id(&self) -> String {
        self.shared.instance_id.clone()
    }

    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockAttempt, StoreError> {
        self.shared.trip(MemoryFault::Acquire)?;
        let deadline = Instant::now() + timeout;
        let mut contended = false;
        loop {
            // Register for wakeups before checking, so a release between the
            // check and the wait is not lost.
            let mut notified = std::pin::pin!(self.shared.released.notified());
            notified.as_mut().enable();
            if self.shared.try_take(name, self.id) {
                return Ok(if contended {
                    LockAttempt::GrantedAfterWait
                } else {
                    LockAttempt::Granted
                });
            }
            contended = true;
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(LockAttempt::Held);
            }
        }
    }

    async fn release(&self, name: &str) -> Result<(), StoreError> {
        self.shared.trip(MemoryFault::Release)?;
        if !self.shared.give_back(name, self.id) {
            tracing::debug!(lock = name, connection = self.id, "Release of a lock not held");
        }
        Ok(())
    }

    async fn current_holder(&self, name: &str) -> Result<Option<LockHolderId>, StoreError> {
        self.shared.trip(MemoryFault::CurrentHolder)?;
        Ok(self
            .shared
            .state()
            .locks
            .get(name)
            .map(|id| LockHolderId(format!("connection {id}"))))
    }

    async fn session_id(&self) -> Result<LockHolderId, StoreError> {
        self.shared.trip(MemoryFault::SessionId)?;
        Ok(LockHolderId(format!("connection {}", self.id)))
    }
}

#[async_trait]
impl Ledger for MemorySession {
    async fn exists_exact(
        &self,
        category: Category,
        revision_date: NaiveDate,
        version_label: &str,
        checksum: &str,
    ) -> Result<bool, StoreError> {
        self.shared.trip(MemoryFault::Query)?;
        Ok(self.shared.state().records.iter().any(|record| {
            record.category == category
                && record.revision_date == Some(revision_date)
                && record.version_label.as_deref() == Some(version_label)
                && record.checksum == checksum
        }))
    }

    async fn exists_any(&self, category: Category) -> Result<bool, StoreError> {
        self.shared.trip(MemoryFault::Query)?;
        Ok(self
            .shared
            .state()
            .records
            .iter()
            .any(|record| record.category == category))
    }

    async fn insert(&self, record: &TrackingRecord) -> Result<(), StoreError> {
        self.shared.trip(MemoryFault::Insert)?;
        self.shared.state().records.push(record.clone());
        Ok(())
    }

    async fn lookup_by_filename_and_checksum(
        &self,
        category: Category,
        filename: &str,
        checksum: &str,
    ) -> Result<Option<DatasetRevision>, StoreError> {
        self.shared.trip(MemoryFault::Query)?;
        Ok(self
            .shared
            .state()
            .datasets
            .iter()
            .find(|dataset| {
                dataset.category == category
                    && dataset.filename == filename
                    && dataset.checksum == checksum
            })
            .map(|dataset| dataset.revision.clone()))
    }

    async fn records(&self, category: Option<Category>) -> Result<Vec<TrackingRecord>, StoreError> {
        self.shared.trip(MemoryFault::Query)?;
        Ok(self
            .shared
            .state()
            .records
            .iter()
            .rev()
            .filter(|record| category.is_none_or(|c| record.category == c))
            .cloned()
            .collect())
    }

    async fn register_dataset(&self, dataset: &SupportedDataset) -> Result<(), StoreError> {
        self.shared.trip(MemoryFault::Insert)?;
        let mut state = self.shared.state();
        state.datasets.retain(|existing| {
            !(existing.category == dataset.category
                && existing.filename == dataset.filename
                && existing.checksum == dataset.checksum)
        });
        state.datasets.push(dataset.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let store = MemoryStore::new("main");
        let a = store.connect();
        let b = store.connect();

        assert_eq!(
            a.acquire("L", Duration::ZERO).await.expect("a acquire"),
            LockAttempt::Granted
        );
        assert_eq!(b.acquire("L", Duration::ZERO).await.expect("b try"), LockAttempt::Held);

        let release_at = Instant::now() + Duration::from_secs(3);
        let releaser = tokio::spawn(async move {
            tokio::time::sleep_until(release_at).await;
            a.release("L").await.expect("release");
            a
        });

        assert_eq!(
            b.acquire("L", Duration::from_secs(10)).await.expect("b wait"),
            LockAttempt::GrantedAfterWait
        );
        assert!(Instant::now() >= release_at);
        assert_eq!(store.holder_of("L"), Some(b.connection_id()));
        drop(releaser.await.expect("join"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let store = MemoryStore::new("main");
        let a = store.connect();
        let b = store.connect();
        assert!(a.acquire("L", Duration::ZERO).await.expect("a").is_granted());

        let start = Instant::now();
        assert_eq!(
            b.acquire("L", Duration::from_secs(10)).await.expect("b"),
            LockAttempt::Held
        );
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_dropping_session_releases_its_locks() {
        let store = MemoryStore::new("main");
        let a = store.connect();
        assert!(a.acquire("L1", Duration::ZERO).await.expect("L1").is_granted());
        assert!(a.acquire("L2", Duration::ZERO).await.expect("L2").is_granted());
        assert_eq!(store.held_lock_count(), 2);

        drop(a);
        assert_eq!(store.held_lock_count(), 0);

        let b = store.connect();
        assert!(b.acquire("L1", Duration::ZERO).await.expect("b L1").is_granted());
    }

    #[tokio::test]
    async fn test_release_of_foreign_lock_is_ignored() {
        let store = MemoryStore::new("main");
        let a = store.connect();
        let b = store.connect();
        assert!(a.acquire("L", Duration::ZERO).await.expect("a").is_granted());
        b.release("L").await.expect("foreign release is not an error");
        assert_eq!(store.holder_of("L"), Some(a.connection_id()));
    }

    #[tokio::test]
    async fn test_injected_fault_trips_once() {
        let store = MemoryStore::new("main");
        let a = store.connect();
        store.inject_fault(MemoryFault::Acquire, 1);
        assert!(a.acquire("L", Duration::ZERO).await.is_err());
        assert!(a.acquire("L", Duration::ZERO).await.expect("second try").is_granted());
    }
}
