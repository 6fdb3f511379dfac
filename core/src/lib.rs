//! Coordinated, idempotent imports of versioned reference datasets
//!
//! Several importers may target the same store at once. This crate makes sure
//! that:
//! - at most one import per dataset category runs against a store at a time,
//!   using a named lock held by the store itself
//! - an artifact that was already applied (same category, release date,
//!   version and checksum) is not applied again
//! - an importer that waited for the lock does not repeat work a competitor
//!   finished in the meantime
//!
//! Ingestion itself is delegated to a [`DatasetLoader`] per category.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod artifact;
pub mod category;
pub mod config;
pub mod detector;
pub mod errors;
pub mod guard;
pub mod loader;
pub mod lock;
pub mod memory_store;
pub mod orchestrator;
pub mod sqlite_store;
pub mod store;

pub use artifact::{Artifact, FormatFlags, checksum_file, compute_checksum};
pub use category::{Category, UnknownCategory};
pub use config::{LoaderConfig, LockConfig, RefSyncConfig};
pub use detector::Detector;
pub use errors::{ErrorKind, ImportWarning, LoaderError, RefSyncError, Result, StoreError};
pub use guard::IdempotencyGuard;
pub use loader::{CommandLoader, DatasetLoader, LoadRequest, LoaderTable};
pub use lock::{LockCoordinator, LockGuard, LockHandle, LockRetryPolicy};
pub use memory_store::{MemoryFault, MemorySession, MemoryStore};
pub use orchestrator::{ImportOrchestrator, ImportOutcome, ImportReport, ImportRequest};
pub use sqlite_store::SqliteStore;
pub use store::{
    DatasetRevision, Ledger, LockAttempt, LockHolderId, LockStore, StoreClient, SupportedDataset,
    TrackingRecord,
};

use chrono::NaiveDate;
use std::path::Path;
use std::sync::Arc;

/// refsync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configured importer over the SQLite store
pub struct RefSyncEngine {
    cfg: RefSyncConfig,
    store: Arc<SqliteStore>,
    orchestrator: ImportOrchestrator<SqliteStore>,
}

impl RefSyncEngine {
    /// Load config and open the store
    pub fn new() -> Result<Self> {
        Self::with_config(RefSyncConfig::load()?)
    }

    pub fn with_config(cfg: RefSyncConfig) -> Result<Self> {
        let db_path = cfg.resolved_db_path();
        let store = Arc::new(SqliteStore::open(&db_path, cfg.store_instance.as_deref())?);
        let loaders = LoaderTable::from_config(&cfg)?;
        let orchestrator = ImportOrchestrator::new(Arc::clone(&store), cfg.retry_policy(), loaders);

        tracing::info!(
            version = VERSION,
            db_path = %db_path.display(),
            instance = %store.instance_id(),
            "refsync engine initialized"
        );
        Ok(Self {
            cfg,
            store,
            orchestrator,
        })
    }

    pub fn config(&self) -> &RefSyncConfig {
        &self.cfg
    }

    pub async fn import(&self, request: ImportRequest) -> Result<ImportReport> {
        self.orchestrator.run(request).await
    }

    /// Classify an artifact without importing it.
    pub async fn detect(&self, path: &Path) -> Result<Option<Artifact>> {
        Detector::new(self.store.as_ref()).detect(path).await
    }

    /// Recorded loads, newest first.
    pub async fn status(&self, category: Option<Category>) -> Result<Vec<TrackingRecord>> {
        self.store
            .records(category)
            .await
            .map_err(|err| RefSyncError::store("ledger listing", None, err))
    }

    /// Register a dataset file whose name carries no release date.
    pub async fn register(
        &self,
        path: &Path,
        category: Category,
        revision_date: NaiveDate,
        version_label: &str,
    ) -> Result<SupportedDataset> {
        let checksum = checksum_file(path).await.map_err(|e| {
            RefSyncError::io(format!("failed to read artifact {}", path.display()), e)
        })?;
        let dataset = SupportedDataset {
            category,
            filename: artifact::file_name_of(path),
            checksum,
            revision: DatasetRevision {
                revision_date,
                version_label: version_label.to_string(),
            },
        };
        self.store
            .register_dataset(&dataset)
            .await
            .map_err(|err| RefSyncError::store("dataset registration", None, err))?;
        tracing::info!(
            category = %category,
            filename = %dataset.filename,
            date = %revision_date,
            version = version_label,
            "Dataset registered"
        );
        Ok(dataset)
    }
}
