//! Idempotency checks against the tracking ledger.

use crate::artifact::Artifact;
use crate::category::Category;
use crate::errors::{RefSyncError, Result};
use crate::store::Ledger;
use chrono::NaiveDate;

pub struct IdempotencyGuard<'a> {
    ledger: &'a dyn Ledger,
}

impl<'a> IdempotencyGuard<'a> {
    pub fn new(ledger: &'a dyn Ledger) -> Self {
        Self { ledger }
    }

    /// True iff a ledger record matches all four fields.
    ///
    /// Any unknown field answers `false` without querying: a partially
    /// identified artifact can never be judged already loaded.
    pub async fn is_exactly_loaded(
        &self,
        category: Category,
        revision_date: Option<NaiveDate>,
        version_label: Option<&str>,
        checksum: Option<&str>,
    ) -> Result<bool> {
        let (Some(date), Some(version), Some(checksum)) = (revision_date, version_label, checksum)
        else {
            tracing::debug!(category = %category, "Skipping exact-match check, artifact not fully identified");
            return Ok(false);
        };
        if checksum.is_empty() || version.is_empty() {
            return Ok(false);
        }
        self.ledger
            .exists_exact(category, date, version, checksum)
            .await
            .map_err(|err| RefSyncError::store("ledger exact-match check", None, err))
    }

    /// Exact-match check for a detected artifact.
    pub async fn is_artifact_loaded(&self, artifact: &Artifact) -> Result<bool> {
        self.is_exactly_loaded(
            artifact.category,
            artifact.detected_date,
            artifact.detected_version.as_deref(),
            Some(artifact.checksum.as_str()),
        )
        .await
    }

    /// True iff any load of `category` was ever recorded.
    pub async fn is_any_loaded(&self, category: Category) -> Result<bool> {
        self.ledger
            .exists_any(category)
            .await
            .map_err(|err| RefSyncError::store("ledger category check", None, err))
    }
}
