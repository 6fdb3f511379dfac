//! Import orchestration
//!
//! One run takes an artifact path through detection, the exact-match
//! pre-check, the category lock, the post-wait re-check, the loader and the
//! ledger update. The lock is released before `run` returns on every path
//! that gets that far, whatever the loader did.

use crate::artifact::Artifact;
use crate::category::Category;
use crate::detector::Detector;
use crate::errors::{ErrorKind, ImportWarning, RefSyncError, Result};
use crate::guard::IdempotencyGuard;
use crate::loader::{DatasetLoader, LoadRequest, LoaderTable};
use crate::lock::{LockCoordinator, LockHandle, LockRetryPolicy};
use crate::store::{Ledger, LockStore, StoreClient, TrackingRecord};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

/// What the caller asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub path: PathBuf,
    /// Category to use when no detection pattern matches
    pub category_override: Option<Category>,
    /// Skip the exact-match pre-check
    pub force: bool,
}

impl ImportRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            category_override: None,
            force: false,
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category_override = Some(category);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The loader ran and the load was recorded (unless a warning says otherwise)
    Loaded { record: TrackingRecord, attempts: u32 },
    /// An identical artifact was already applied; no lock was requested
    AlreadyLoaded,
    /// Another session loaded the category while this one waited for the lock
    SatisfiedWhileWaiting { attempts: u32 },
}

impl ImportOutcome {
    pub fn is_skip(&self) -> bool {
        !matches!(self, Self::Loaded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub artifact: Artifact,
    pub outcome: ImportOutcome,
    pub warnings: Vec<ImportWarning>,
}

/// Runs imports against one store session.
pub struct ImportOrchestrator<S> {
    store: Arc<S>,
    coordinator: LockCoordinator,
    loaders: LoaderTable,
}

impl<S: StoreClient + 'static> ImportOrchestrator<S> {
    pub fn new(store: Arc<S>, policy: LockRetryPolicy, loaders: LoaderTable) -> Self {
        let lock_store: Arc<dyn LockStore> = store.clone();
        Self {
            store,
            coordinator: LockCoordinator::new(lock_store, policy),
            loaders,
        }
    }

    pub fn coordinator(&self) -> &LockCoordinator {
        &self.coordinator
    }

    /// Run one import.
    pub async fn run(&self, request: ImportRequest) -> Result<ImportReport> {
        let result = self.run_inner(&request).await;
        if let Err(err) = &result {
            tracing::error!(
                path = %request.path.display(),
                error_kind = err.kind().as_str(),
                error = %err,
                "Import failed"
            );
        }
        result
    }

    async fn run_inner(&self, request: &ImportRequest) -> Result<ImportReport> {
        let ledger: &dyn Ledger = self.store.as_ref();
        let artifact = Detector::new(ledger)
            .resolve(&request.path, request.category_override)
            .await?;
        let category = artifact.category;

        let loader = self
            .loaders
            .get(category)
            .ok_or(RefSyncError::MissingLoader { category })?;

        let guard = IdempotencyGuard::new(ledger);
        if request.force {
            tracing::info!(category = %category, "Forced import, skipping exact-match check");
        } else if guard.is_artifact_loaded(&artifact).await? {
            tracing::info!(
                category = %category,
                filename = %artifact.filename,
                "Identical artifact already loaded, skipping"
            );
            return Ok(ImportReport {
                artifact,
                outcome: ImportOutcome::AlreadyLoaded,
                warnings: Vec::new(),
            });
        }

        let mut lock = self.coordinator.acquire(category).await?;
        let result = self
            .critical_section(&guard, &artifact, loader.as_ref(), lock.handle())
            .await;
        lock.release().await;

        let (outcome, warnings) = result?;
        Ok(ImportReport {
            artifact,
            outcome,
            warnings,
        })
    }

    async fn critical_section(
        &self,
        guard: &IdempotencyGuard<'_>,
        artifact: &Artifact,
        loader: &dyn DatasetLoader,
        handle: &LockHandle,
    ) -> Result<(ImportOutcome, Vec<ImportWarning>)> {
        let category = artifact.category;
        let attempts = handle.attempts;

        if handle.waited_for_lock() && guard.is_any_loaded(category).await? {
            tracing::info!(
                category = %category,
                attempts,
                "Category loaded by another session while waiting, skipping"
            );
            return Ok((ImportOutcome::SatisfiedWhileWaiting { attempts }, Vec::new()));
        }

        tracing::info!(category = %category, filename = %artifact.filename, "Loading dataset");
        loader
            .load(&LoadRequest::for_artifact(artifact))
            .await
            .map_err(|source| RefSyncError::Loader {
                category,
                lock_name: handle.lock_name.clone(),
                source,
            })?;

        let record = TrackingRecord {
            category,
            revision_date: artifact.detected_date,
            version_label: artifact.detected_version.clone(),
            checksum: artifact.checksum.clone(),
            loaded_at: Utc::now(),
        };

        let mut warnings = Vec::new();
        match self.store.insert(&record).await {
            Ok(()) => tracing::info!(
                category = %category,
                version = ?record.version_label,
                date = ?record.revision_date,
                "Dataset loaded and recorded"
            ),
            Err(err) => {
                tracing::warn!(
                    category = %category,
                    error_kind = ErrorKind::LedgerUpdate.as_str(),
                    error = %err,
                    "Dataset loaded but the tracking record could not be written"
                );
                warnings.push(ImportWarning {
                    kind: ErrorKind::LedgerUpdate,
                    message: format!("{category} loaded but not recorded: {err}"),
                });
            }
        }

        Ok((ImportOutcome::Loaded { record, attempts }, warnings))
    }
}
