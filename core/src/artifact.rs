//! Classified import artifacts.

use crate::category::Category;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Format variant of an artifact, handed to the loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatFlags {
    /// SNOMED Release Format 2 (as opposed to the legacy RF1 layout)
    pub rf2: bool,
    /// SNOMED US Edition / US extension content
    pub us_extension: bool,
}

/// A dataset archive with everything detection could learn about it.
///
/// Built once by the detector and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub filename: String,
    pub category: Category,
    /// `None` when the category was supplied by the caller, or the dataset
    /// registration lookup found nothing
    pub detected_version: Option<String>,
    pub detected_date: Option<NaiveDate>,
    pub flags: FormatFlags,
    /// Lower-case hex SHA-256 of the full file content
    pub checksum: String,
}

impl Artifact {
    /// Whether every field the exact-match check needs is known.
    pub fn is_fully_identified(&self) -> bool {
        self.detected_version.is_some() && self.detected_date.is_some()
    }
}

/// File name component of `path`, lossily converted.
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Hash the full content of `path`.
pub fn compute_checksum(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// [`compute_checksum`] on the blocking pool; archives can be large.
pub async fn checksum_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || compute_checksum(&path))
        .await
        .map_err(std::io::Error::other)?
}
