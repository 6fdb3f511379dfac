//! Dataset loaders
//!
//! The import core never ingests data itself. It hands a [`LoadRequest`] to
//! the [`DatasetLoader`] registered for the artifact's category and only
//! records the load once that loader reports success.

use crate::artifact::{Artifact, FormatFlags};
use crate::category::Category;
use crate::config::RefSyncConfig;
use crate::errors::{LoaderError, RefSyncError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

/// Everything a loader needs to ingest one artifact.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub category: Category,
    pub flags: FormatFlags,
    pub artifact: Artifact,
}

impl LoadRequest {
    pub fn for_artifact(artifact: &Artifact) -> Self {
        Self {
            category: artifact.category,
            flags: artifact.flags,
            artifact: artifact.clone(),
        }
    }
}

/// Ingests one dataset category into the store.
#[async_trait]
pub trait DatasetLoader: Send + Sync {
    async fn load(&self, request: &LoadRequest) -> std::result::Result<(), LoaderError>;
}

/// Loader per category.
#[derive(Clone, Default)]
pub struct LoaderTable {
    loaders: BTreeMap<Category, Arc<dyn DatasetLoader>>,
}

impl LoaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `loader` for `category`, replacing any previous one.
    pub fn insert(&mut self, category: Category, loader: Arc<dyn DatasetLoader>) {
        self.loaders.insert(category, loader);
    }

    pub fn with(mut self, category: Category, loader: Arc<dyn DatasetLoader>) -> Self {
        self.insert(category, loader);
        self
    }

    pub fn get(&self, category: Category) -> Option<Arc<dyn DatasetLoader>> {
        self.loaders.get(&category).cloned()
    }

    pub fn categories(&self) -> impl Iterator<Item = Category> + '_ {
        self.loaders.keys().copied()
    }

    /// Build a table of [`CommandLoader`]s from `[loaders.*]`.
    pub fn from_config(config: &RefSyncConfig) -> Result<Self> {
        let mut table = Self::new();
        for (category, loader) in &config.loaders {
            let command = CommandLoader::from_argv(&loader.command).ok_or_else(|| {
                RefSyncError::config(format!("loaders.{category}.command must not be empty"))
            })?;
            table.insert(*category, Arc::new(command));
        }
        Ok(table)
    }
}

impl std::fmt::Debug for LoaderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.loaders.keys()).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CommandLoader
// ─────────────────────────────────────────────────────────────────────────────

/// Runs an external program per load.
///
/// Arguments may contain `{artifact}`, `{category}`, `{rf2}`,
/// `{us_extension}`, `{version}` and `{date}`; the same values are exported
/// as `REFSYNC_*` environment variables. Unknown values expand to "".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLoader {
    program: String,
    args: Vec<String>,
}

impl CommandLoader {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split `argv` into program and arguments. `None` when empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments with placeholders filled in for `request`.
    pub fn expand_args(&self, request: &LoadRequest) -> Vec<String> {
        let values = placeholder_values(request);
        self.args
            .iter()
            .map(|arg| {
                values.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
            })
            .collect()
    }
}

fn placeholder_values(request: &LoadRequest) -> [(&'static str, String); 6] {
    let artifact = &request.artifact;
    [
        ("artifact", artifact.path.display().to_string()),
        ("category", request.category.as_str().to_string()),
        ("rf2", request.flags.rf2.to_string()),
        ("us_extension", request.flags.us_extension.to_string()),
        (
            "version",
            artifact.detected_version.clone().unwrap_or_default(),
        ),
        (
            "date",
            artifact
                .detected_date
                .map(|date| date.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
        ),
    ]
}

#[async_trait]
impl DatasetLoader for CommandLoader {
    async fn load(&self, request: &LoadRequest) -> std::result::Result<(), LoaderError> {
        let args = self.expand_args(request);
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .env("REFSYNC_CHECKSUM", &request.artifact.checksum);
        for (key, value) in placeholder_values(request) {
            cmd.env(format!("REFSYNC_{}", key.to_ascii_uppercase()), value);
        }

        tracing::info!(
            program = %self.program,
            args = ?args,
            category = %request.category,
            "Running loader"
        );
        let status = cmd.status().await.map_err(|source| LoaderError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !status.success() {
            return Err(LoaderError::Exit {
                program: self.program.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}
