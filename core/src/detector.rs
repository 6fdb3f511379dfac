//! Artifact metadata detection.
//!
//! Classifies a dataset archive from its file name using an ordered pattern
//! table; the first matching entry wins. Several entries are specializations
//! of later ones (every SNOMED production archive also matches the generic
//! SNOMED entry), so the table order is part of the contract.
//!
//! ICD archives carry no usable date in their names. Their date and version
//! come from the ledger's dataset registrations, keyed by file name and
//! checksum. The lookup also runs when the caller names such a category for
//! a file the table does not recognise.

use crate::artifact::{Artifact, FormatFlags, checksum_file, file_name_of};
use crate::category::Category;
use crate::errors::{RefSyncError, Result};
use crate::store::Ledger;
use chrono::NaiveDate;
use regex_lite::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// How a table entry turns a match into a release date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRule {
    /// First capture group is `MMDDYYYY`
    MonthDayYear,
    /// First capture group is `YYYYMMDD`
    YearMonthDay,
    /// Date and version come from the ledger's dataset registrations
    LedgerLookup,
}

struct PatternEntry {
    regex: Regex,
    category: Category,
    version: Option<&'static str>,
    date_rule: DateRule,
    flags: FormatFlags,
}

const RF1: FormatFlags = FormatFlags {
    rf2: false,
    us_extension: false,
};
const RF2: FormatFlags = FormatFlags {
    rf2: true,
    us_extension: false,
};
const RF1_US: FormatFlags = FormatFlags {
    rf2: false,
    us_extension: true,
};
const RF2_US: FormatFlags = FormatFlags {
    rf2: true,
    us_extension: true,
};

#[rustfmt::skip]
const PATTERNS: &[(&str, Category, Option<&str>, DateRule, FormatFlags)] = &[
    (r"^RxNorm_full_prescribe_(\d{8})\.zip$", Category::Rxnorm, Some("Prescribable"), DateRule::MonthDayYear, RF1),
    (r"^RxNorm_full_(\d{8})\.zip$", Category::Rxnorm, Some("Standard"), DateRule::MonthDayYear, RF1),
    (r"^SnomedCT_InternationalRF2_PRODUCTION_(\d{8})T\d{6}Z\.zip$", Category::Snomed, Some("International:English"), DateRule::YearMonthDay, RF2),
    (r"^SnomedCT_SpanishRelease-es_PRODUCTION_(\d{8})T\d{6}Z\.zip$", Category::Snomed, Some("International:Spanish"), DateRule::YearMonthDay, RF2),
    (r"^SnomedCT_USEditionRF2_PRODUCTION_(\d{8})T\d{6}Z\.zip$", Category::Snomed, Some("US Extension"), DateRule::YearMonthDay, RF2_US),
    (r"^SnomedCT_ManagedServiceUS_PRODUCTION_US1000124_(\d{8})T\d{6}Z\.zip$", Category::Snomed, Some("US Extension"), DateRule::YearMonthDay, RF2_US),
    (r"^SnomedCT_Release-es_INT_(\d{8})\.zip$", Category::Snomed, Some("International:Spanish"), DateRule::YearMonthDay, RF1),
    (r"^sct1_National_US_(\d{8})\.zip$", Category::Snomed, Some("US Extension"), DateRule::YearMonthDay, RF1_US),
    (r"^SnomedCT_(?:RF1Release_)?INT_(\d{8})\.zip$", Category::Snomed, Some("International:English"), DateRule::YearMonthDay, RF1),
    // Generic legacy entry; must stay after every specific SNOMED entry.
    (r"^SnomedCT_.*_(\d{8})(?:T\d{6}Z)?\.zip$", Category::Snomed, Some("International:English"), DateRule::YearMonthDay, RF1),
    (r"(?i)^cmsv\d+_master_descriptions.*\.zip$", Category::Icd9, None, DateRule::LedgerLookup, RF1),
    (r"(?i)^\d{4}[-_ ].*(?:icd-?10|pcs|cm|code[-_ ]descriptions|code[-_ ]tables|tabular|order[-_ ]file).*\.zip$", Category::Icd10, None, DateRule::LedgerLookup, RF1),
    (r"^e[pc]_.*_cms_(\d{8})\.xml\.zip$", Category::CqmValueset, Some("Standard"), DateRule::YearMonthDay, RF1),
];

#[allow(clippy::expect_used)]
fn table() -> &'static [PatternEntry] {
    static TABLE: OnceLock<Vec<PatternEntry>> = OnceLock::new();
    TABLE.get_or_init(|| {
        PATTERNS
            .iter()
            .map(|(pattern, category, version, date_rule, flags)| PatternEntry {
                regex: Regex::new(pattern).expect("valid detection pattern"),
                category: *category,
                version: *version,
                date_rule: *date_rule,
                flags: *flags,
            })
            .collect()
    })
}

/// Parse an 8-digit date capture under `rule`. Impossible dates yield `None`.
pub fn parse_date(digits: &str, rule: DateRule) -> Option<NaiveDate> {
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (year, month, day) = match rule {
        DateRule::MonthDayYear => (&digits[4..8], &digits[0..2], &digits[2..4]),
        DateRule::YearMonthDay => (&digits[0..4], &digits[4..6], &digits[6..8]),
        DateRule::LedgerLookup => return None,
    };
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

/// Name-only classification result, before checksum and ledger lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameMatch {
    pub category: Category,
    pub version: Option<String>,
    pub date: Option<NaiveDate>,
    pub date_rule: DateRule,
    pub flags: FormatFlags,
}

/// Classify a file name against the pattern table.
pub fn classify_filename(filename: &str) -> Option<NameMatch> {
    table().iter().find_map(|entry| {
        let captures = entry.regex.captures(filename)?;
        let date = match entry.date_rule {
            DateRule::LedgerLookup => None,
            rule => {
                let digits = captures.get(1)?.as_str();
                match parse_date(digits, rule) {
                    Some(date) => Some(date),
                    None => {
                        tracing::debug!(filename, digits, "Pattern matched but date is invalid");
                        return None;
                    }
                }
            }
        };
        Some(NameMatch {
            category: entry.category,
            version: entry.version.map(str::to_string),
            date,
            date_rule: entry.date_rule,
            flags: entry.flags,
        })
    })
}

/// Detects artifacts, consulting the ledger where names carry no date.
pub struct Detector<'a> {
    ledger: &'a dyn Ledger,
}

impl<'a> Detector<'a> {
    pub fn new(ledger: &'a dyn Ledger) -> Self {
        Self { ledger }
    }

    /// Classify `path`. `Ok(None)` means no pattern matched.
    pub async fn detect(&self, path: &Path) -> Result<Option<Artifact>> {
        let filename = file_name_of(path);
        let checksum = checksum_of(path).await?;
        self.classify(path, filename, checksum).await
    }

    async fn classify(
        &self,
        path: &Path,
        filename: String,
        checksum: String,
    ) -> Result<Option<Artifact>> {
        let Some(found) = classify_filename(&filename) else {
            tracing::debug!(filename = %filename, "No detection pattern matched");
            return Ok(None);
        };

        let (detected_version, detected_date) = match found.date_rule {
            DateRule::LedgerLookup => {
                self.registered_revision(found.category, &filename, &checksum)
                    .await?
            }
            _ => (found.version, found.date),
        };

        let artifact = Artifact {
            path: path.to_path_buf(),
            filename,
            category: found.category,
            detected_version,
            detected_date,
            flags: found.flags,
            checksum,
        };
        tracing::info!(
            filename = %artifact.filename,
            category = %artifact.category,
            version = ?artifact.detected_version,
            date = ?artifact.detected_date,
            rf2 = artifact.flags.rf2,
            us_extension = artifact.flags.us_extension,
            "Artifact detected"
        );
        Ok(Some(artifact))
    }

    /// Version and date from the dataset registrations.
    async fn registered_revision(
        &self,
        category: Category,
        filename: &str,
        checksum: &str,
    ) -> Result<(Option<String>, Option<NaiveDate>)> {
        let revision = self
            .ledger
            .lookup_by_filename_and_checksum(category, filename, checksum)
            .await
            .map_err(|err| RefSyncError::store("dataset lookup", None, err))?;
        match revision {
            Some(revision) => Ok((Some(revision.version_label), Some(revision.revision_date))),
            None => {
                tracing::warn!(
                    filename,
                    category = %category,
                    "Dataset is not registered; release date and version unknown"
                );
                Ok((None, None))
            }
        }
    }

    /// Detect `path`, falling back to `category_override` when nothing
    /// matches. An explicit override never replaces a detected category.
    pub async fn resolve(
        &self,
        path: &Path,
        category_override: Option<Category>,
    ) -> Result<Artifact> {
        let filename = file_name_of(path);
        let checksum = checksum_of(path).await?;
        if let Some(artifact) = self
            .classify(path, filename.clone(), checksum.clone())
            .await?
        {
            if let Some(requested) = category_override
                && requested != artifact.category
            {
                tracing::warn!(
                    detected = %artifact.category,
                    requested = %requested,
                    "Ignoring category override for a recognised artifact"
                );
            }
            return Ok(artifact);
        }

        let Some(category) = category_override else {
            return Err(RefSyncError::Classification {
                path: path.to_path_buf(),
            });
        };
        tracing::info!(path = %path.display(), category = %category, "Using caller-supplied category");
        let (detected_version, detected_date) = if uses_registrations(category) {
            self.registered_revision(category, &filename, &checksum)
                .await?
        } else {
            (None, None)
        };
        Ok(Artifact {
            path: path.to_path_buf(),
            filename,
            category,
            detected_version,
            detected_date,
            flags: FormatFlags::default(),
            checksum,
        })
    }
}

/// Whether `category` takes its date and version from dataset registrations.
pub fn uses_registrations(category: Category) -> bool {
    PATTERNS
        .iter()
        .any(|(_, entry, _, rule, _)| *entry == category && *rule == DateRule::LedgerLookup)
}

async fn checksum_of(path: &Path) -> Result<String> {
    checksum_file(path)
        .await
        .map_err(|err| RefSyncError::io(format!("failed to read artifact {}", path.display()), err))
}
