//! Dataset categories.
//!
//! One named lock and one loader exist per category, so this enum is the key
//! for lock naming, ledger rows and the loader table.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Category {
    Rxnorm,
    Snomed,
    Icd9,
    Icd10,
    CqmValueset,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Self::Rxnorm,
        Self::Snomed,
        Self::Icd9,
        Self::Icd10,
        Self::CqmValueset,
    ];

    /// Label stored in the ledger and folded into lock names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rxnorm => "RXNORM",
            Self::Snomed => "SNOMED",
            Self::Icd9 => "ICD9",
            Self::Icd10 => "ICD10",
            Self::CqmValueset => "CQM_VALUESET",
        }
    }

    /// Parse a label case-insensitively
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(label))
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dataset category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

impl TryFrom<String> for Category {
    type Error = UnknownCategory;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.as_str().to_string()
    }
}
