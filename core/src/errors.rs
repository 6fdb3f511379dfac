//! refsync error types
//!
//! Every fatal outcome of an import run maps to exactly one [`ErrorKind`], so
//! callers branch on the kind instead of matching message text. Ledger-update
//! failures are the one non-fatal kind: they surface as [`ImportWarning`]s.

use crate::category::Category;
use std::path::PathBuf;
use thiserror::Error;

/// Error kind for structured logging and exit-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Artifact matched no detection pattern and no category was supplied
    Classification,
    /// Lock or ledger call failed at the transport/session level
    StoreConnectivity,
    /// Retries exhausted while the lock stayed held
    LockContentionExhausted,
    /// Lock held on the single attempt allowed by no-wait mode
    NoWaitContention,
    /// The external loader reported failure
    Loader,
    /// No loader is configured for the category
    MissingLoader,
    /// Post-load bookkeeping failed (never fatal)
    LedgerUpdate,
    /// `refsync.toml` or env misconfigured
    Config,
    /// Artifact could not be read
    Io,
}

impl ErrorKind {
    /// Machine-readable code for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classification => "CLASSIFICATION_FAILURE",
            Self::StoreConnectivity => "STORE_CONNECTIVITY",
            Self::LockContentionExhausted => "LOCK_CONTENTION_EXHAUSTED",
            Self::NoWaitContention => "NO_WAIT_CONTENTION",
            Self::Loader => "LOADER_FAILURE",
            Self::MissingLoader => "MISSING_LOADER",
            Self::LedgerUpdate => "LEDGER_UPDATE_FAILURE",
            Self::Config => "CONFIG_ERROR",
            Self::Io => "IO_ERROR",
        }
    }

    /// Whether this kind aborts the run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::LedgerUpdate)
    }

    /// Whether the run failed only because another session held the lock
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::LockContentionExhausted | Self::NoWaitContention)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a lock or ledger primitive.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {context}")]
    Query {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("store session unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn query(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Query {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

/// Failure reported by an external dataset loader.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to start loader `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("loader `{program}` exited with {status}")]
    Exit { program: String, status: String },

    #[error("{0}")]
    Failed(String),
}

/// refsync error with kind and context
#[derive(Debug, Error)]
pub enum RefSyncError {
    #[error("cannot classify {}: no detection pattern matched and no category was given", .path.display())]
    Classification { path: PathBuf },

    #[error("store error during {operation}{}", lock_suffix(.lock_name.as_deref()))]
    StoreConnectivity {
        operation: &'static str,
        lock_name: Option<String>,
        #[source]
        source: StoreError,
    },

    #[error(
        "gave up on {category} lock `{lock_name}` after {attempts} attempts and {waited_secs}s of waiting{}",
        holder_suffix(.holder.as_deref())
    )]
    LockContentionExhausted {
        category: Category,
        lock_name: String,
        attempts: u32,
        waited_secs: u64,
        holder: Option<String>,
    },

    #[error(
        "{category} lock `{lock_name}` is held and no-wait mode is enabled{}",
        holder_suffix(.holder.as_deref())
    )]
    NoWaitContention {
        category: Category,
        lock_name: String,
        holder: Option<String>,
    },

    #[error("{category} loader failed")]
    Loader {
        category: Category,
        lock_name: String,
        #[source]
        source: LoaderError,
    },

    #[error("no loader configured for {category}")]
    MissingLoader { category: Category },

    #[error("config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

fn lock_suffix(lock_name: Option<&str>) -> String {
    lock_name
        .map(|name| format!(" (lock `{name}`)"))
        .unwrap_or_default()
}

fn holder_suffix(holder: Option<&str>) -> String {
    holder
        .map(|holder| format!("; held by {holder}"))
        .unwrap_or_default()
}

impl RefSyncError {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Classification { .. } => ErrorKind::Classification,
            Self::StoreConnectivity { .. } => ErrorKind::StoreConnectivity,
            Self::LockContentionExhausted { .. } => ErrorKind::LockContentionExhausted,
            Self::NoWaitContention { .. } => ErrorKind::NoWaitContention,
            Self::Loader { .. } => ErrorKind::Loader,
            Self::MissingLoader { .. } => ErrorKind::MissingLoader,
            Self::Config { .. } => ErrorKind::Config,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Create a store connectivity error
    pub fn store(operation: &'static str, lock_name: Option<&str>, source: StoreError) -> Self {
        Self::StoreConnectivity {
            operation,
            lock_name: lock_name.map(str::to_string),
            source,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }
}

/// Non-fatal problem recorded on an otherwise successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportWarning {
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for ImportWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Result type for refsync operations
pub type Result<T> = std::result::Result<T, RefSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        let err = RefSyncError::MissingLoader {
            category: Category::Snomed,
        };
        assert_eq!(err.kind(), ErrorKind::MissingLoader);
        assert_eq!(err.kind().as_str(), "MISSING_LOADER");
        assert!(err.kind().is_fatal());
        assert!(!ErrorKind::LedgerUpdate.is_fatal());
    }

    #[test]
    fn test_contention_messages_are_distinct() {
        let exhausted = RefSyncError::LockContentionExhausted {
            category: Category::Rxnorm,
            lock_name: "refsync_main_RXNORM".to_string(),
            attempts: 3,
            waited_secs: 95,
            holder: Some("connection 7".to_string()),
        };
        let no_wait = RefSyncError::NoWaitContention {
            category: Category::Rxnorm,
            lock_name: "refsync_main_RXNORM".to_string(),
            holder: None,
        };

        assert_eq!(
            exhausted.to_string(),
            "gave up on RXNORM lock `refsync_main_RXNORM` after 3 attempts and 95s of waiting; held by connection 7"
        );
        assert_eq!(
            no_wait.to_string(),
            "RXNORM lock `refsync_main_RXNORM` is held and no-wait mode is enabled"
        );
        assert!(exhausted.kind().is_contention());
        assert!(no_wait.kind().is_contention());
    }

    #[test]
    fn test_store_error_mentions_lock() {
        let err = RefSyncError::store(
            "lock acquire",
            Some("refsync_main_ICD10"),
            StoreError::Unavailable("connection reset".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "store error during lock acquire (lock `refsync_main_ICD10`)"
        );
    }
}
