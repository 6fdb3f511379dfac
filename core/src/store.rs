//! Store primitives consumed by the import core.
//!
//! A store is one session against a shared backend. The named lock is scoped
//! to the whole backend instance and released by the backend when the session
//! ends, so a crashed importer never leaves a lock behind.

use crate::category::Category;
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;

/// Identity of a store session, reported for lock diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockHolderId(pub String);

impl std::fmt::Display for LockHolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a single store-level acquire call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// The lock was free or already ours
    Granted,
    /// Another session held the lock and released it within the timeout
    GrantedAfterWait,
    /// Another session still held the lock when the timeout ran out
    Held,
}

impl LockAttempt {
    pub fn is_granted(self) -> bool {
        !matches!(self, Self::Held)
    }

    /// Whether another session held the lock at some point during the call.
    pub fn was_contended(self) -> bool {
        !matches!(self, Self::Granted)
    }
}

/// One completed load, as persisted in the tracking ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRecord {
    pub category: Category,
    pub revision_date: Option<NaiveDate>,
    pub version_label: Option<String>,
    pub checksum: String,
    pub loaded_at: DateTime<Utc>,
}

/// Date and version of a registered dataset whose filename carries neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRevision {
    pub revision_date: NaiveDate,
    pub version_label: String,
}

/// Registration row for a dataset file identified by name and checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedDataset {
    pub category: Category,
    pub filename: String,
    pub checksum: String,
    pub revision: DatasetRevision,
}

/// Named, session-scoped mutual exclusion provided by the store.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Identifier of the store instance; distinct databases on one server
    /// must report distinct identifiers.
    fn instance_id(&self) -> String;

    /// Try to take `name`, waiting up to `timeout` for a current holder to
    /// release it. The call must return within roughly `timeout`.
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockAttempt, StoreError>;

    /// Release `name` if this session holds it.
    async fn release(&self, name: &str) -> Result<(), StoreError>;

    /// Session currently holding `name`, if any.
    async fn current_holder(&self, name: &str) -> Result<Option<LockHolderId>, StoreError>;

    /// Identity of this session.
    async fn session_id(&self) -> Result<LockHolderId, StoreError>;
}

/// Tracking ledger of completed loads.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn exists_exact(
        &self,
        category: Category,
        revision_date: NaiveDate,
        version_label: &str,
        checksum: &str,
    ) -> Result<bool, StoreError>;

    async fn exists_any(&self, category: Category) -> Result<bool, StoreError>;

    async fn insert(&self, record: &TrackingRecord) -> Result<(), StoreError>;

    async fn lookup_by_filename_and_checksum(
        &self,
        category: Category,
        filename: &str,
        checksum: &str,
    ) -> Result<Option<DatasetRevision>, StoreError>;

    /// Records, newest first, optionally restricted to one category.
    async fn records(&self, category: Option<Category>) -> Result<Vec<TrackingRecord>, StoreError>;

    /// Add or replace a dataset registration.
    async fn register_dataset(&self, dataset: &SupportedDataset) -> Result<(), StoreError>;
}

/// A store session offering both the lock and the ledger.
pub trait StoreClient: LockStore + Ledger {}

impl<T: LockStore + Ledger + ?Sized> StoreClient for T {}
