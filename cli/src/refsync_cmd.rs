//! refsync CLI Commands
//!
//! ## Commands
//!
//! - `refsync import <PATH>` - Import an artifact under the category lock
//! - `refsync detect <PATH>` - Show what an artifact would be imported as
//! - `refsync status` - List recorded loads
//! - `refsync register <PATH>` - Register release metadata for an ICD file

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use refsync_core::{
    Artifact, Category, ImportOutcome, ImportReport, ImportRequest, RefSyncConfig, RefSyncEngine,
    RefSyncError, TrackingRecord,
};
use std::path::{Path, PathBuf};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONTENTION: i32 = 2;

/// refsync: coordinated reference dataset imports
#[derive(Debug, Parser)]
#[command(name = "refsync", version)]
pub struct RefSyncCli {
    /// Config file (default: $REFSYNC_CONFIG or ~/.config/refsync/refsync.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: RefSyncSubcommand,
}

impl RefSyncCli {
    pub async fn run(self) -> i32 {
        let config = self.config.as_deref();
        let result = match self.command {
            RefSyncSubcommand::Import(args) => run_import(config, args).await,
            RefSyncSubcommand::Detect(args) => run_detect(config, args).await,
            RefSyncSubcommand::Status(args) => run_status(config, args).await,
            RefSyncSubcommand::Register(args) => run_register(config, args).await,
        };
        match result {
            Ok(code) => code,
            Err(err) => {
                eprintln!("refsync: {err:#}");
                exit_code_for(&err)
            }
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum RefSyncSubcommand {
    /// Import an artifact
    ///
    /// Skips the load when the same artifact was already applied, or when
    /// another importer loaded the category while this one waited.
    Import(ImportArgs),

    /// Classify an artifact without importing it
    Detect(DetectArgs),

    /// List recorded loads, newest first
    Status(StatusArgs),

    /// Register the release date and version of a file whose name has none
    Register(RegisterArgs),
}

#[derive(Debug, Parser)]
pub struct ImportArgs {
    /// Artifact to import
    pub path: PathBuf,

    /// Category to use if the file name is not recognised
    #[arg(long, value_name = "CATEGORY")]
    pub category: Option<Category>,

    /// Import even if an identical artifact was already loaded
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Parser)]
pub struct DetectArgs {
    /// Artifact to classify
    pub path: PathBuf,

    /// Output as JSON for automation
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Only show this category
    #[arg(long, value_name = "CATEGORY")]
    pub category: Option<Category>,

    /// Output as JSON for automation
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct RegisterArgs {
    /// Dataset file
    pub path: PathBuf,

    #[arg(long, value_name = "CATEGORY")]
    pub category: Category,

    /// Release date (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    pub date: NaiveDate,

    /// Version label
    #[arg(long = "version", value_name = "LABEL")]
    pub version_label: String,
}

/// Map a failure to the process exit code.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<RefSyncError>() {
        Some(err) if err.kind().is_contention() => EXIT_CONTENTION,
        _ => EXIT_FAILURE,
    }
}

fn open_engine(config: Option<&Path>) -> anyhow::Result<RefSyncEngine> {
    let cfg = match config {
        Some(path) => RefSyncConfig::load_from_path(path)?,
        None => RefSyncConfig::load()?,
    };
    Ok(RefSyncEngine::with_config(cfg)?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

async fn run_import(config: Option<&Path>, args: ImportArgs) -> anyhow::Result<i32> {
    let engine = open_engine(config)?;
    let request = ImportRequest {
        path: args.path,
        category_override: args.category,
        force: args.force,
    };
    let report = engine.import(request).await?;
    print_import_report(&report);
    Ok(EXIT_OK)
}

async fn run_detect(config: Option<&Path>, args: DetectArgs) -> anyhow::Result<i32> {
    let engine = open_engine(config)?;
    let Some(artifact) = engine.detect(&args.path).await? else {
        anyhow::bail!(
            "{} is not a recognised dataset; pass --category to import it anyway",
            args.path.display()
        );
    };

    if args.json {
        let output = artifact_json(&artifact);
        println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
    } else {
        println!("{}", artifact.filename);
        println!("  category:     {}", artifact.category);
        println!("  version:      {}", or_unknown(artifact.detected_version.as_deref()));
        println!("  release date: {}", date_or_unknown(artifact.detected_date));
        println!("  rf2:          {}", artifact.flags.rf2);
        println!("  us extension: {}", artifact.flags.us_extension);
        println!("  sha256:       {}", artifact.checksum);
    }
    Ok(EXIT_OK)
}

async fn run_status(config: Option<&Path>, args: StatusArgs) -> anyhow::Result<i32> {
    let engine = open_engine(config)?;
    let records = engine.status(args.category).await?;

    if args.json {
        let output: Vec<serde_json::Value> = records.iter().map(record_json).collect();
        println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
        return Ok(EXIT_OK);
    }

    if records.is_empty() {
        println!("No loads recorded");
    }
    for record in &records {
        println!(
            "{:<13} {:<22} {:<10} {}  {}",
            record.category.as_str(),
            or_unknown(record.version_label.as_deref()),
            date_or_unknown(record.revision_date),
            record.loaded_at.format("%Y-%m-%d %H:%M:%S UTC"),
            record.checksum
        );
    }
    Ok(EXIT_OK)
}

async fn run_register(config: Option<&Path>, args: RegisterArgs) -> anyhow::Result<i32> {
    let engine = open_engine(config)?;
    let dataset = engine
        .register(&args.path, args.category, args.date, &args.version_label)
        .await
        .with_context(|| format!("failed to register {}", args.path.display()))?;
    println!(
        "Registered {} as {} {} released {}",
        dataset.filename, dataset.category, dataset.revision.version_label, dataset.revision.revision_date
    );
    Ok(EXIT_OK)
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_import_report(report: &ImportReport) {
    let artifact = &report.artifact;
    match &report.outcome {
        ImportOutcome::Loaded { attempts, .. } => println!(
            "Loaded {} ({}) from {} after {attempts} lock attempt(s)",
            artifact.category,
            or_unknown(artifact.detected_version.as_deref()),
            artifact.filename
        ),
        ImportOutcome::AlreadyLoaded => println!(
            "Skipped {}: this exact {} release is already loaded",
            artifact.filename, artifact.category
        ),
        ImportOutcome::SatisfiedWhileWaiting { attempts } => println!(
            "Skipped {}: {} was loaded by another importer while waiting ({attempts} lock attempts)",
            artifact.filename, artifact.category
        ),
    }
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
}

fn or_unknown(value: Option<&str>) -> &str {
    value.unwrap_or("unknown")
}

fn iso_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn date_or_unknown(date: Option<NaiveDate>) -> String {
    date.map_or_else(|| "unknown".to_string(), iso_date)
}

fn artifact_json(artifact: &Artifact) -> serde_json::Value {
    serde_json::json!({
        "path": artifact.path.display().to_string(),
        "filename": artifact.filename,
        "category": artifact.category,
        "version": artifact.detected_version,
        "release_date": artifact.detected_date.map(iso_date),
        "rf2": artifact.flags.rf2,
        "us_extension": artifact.flags.us_extension,
        "checksum": artifact.checksum,
    })
}

fn record_json(record: &TrackingRecord) -> serde_json::Value {
    serde_json::json!({
        "category": record.category,
        "version": record.version_label,
        "release_date": record.revision_date.map(iso_date),
        "checksum": record.checksum,
        "loaded_at": record.loaded_at.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_import_args() {
        let cli = RefSyncCli::try_parse_from([
            "refsync",
            "--config",
            "/etc/refsync.toml",
            "import",
            "vendor_drop.zip",
            "--category",
            "snomed",
            "--force",
        ])
        .expect("parse");

        assert_eq!(cli.config, Some(PathBuf::from("/etc/refsync.toml")));
        let RefSyncSubcommand::Import(args) = cli.command else {
            panic!("expected import");
        };
        assert_eq!(args.path, PathBuf::from("vendor_drop.zip"));
        assert_eq!(args.category, Some(Category::Snomed));
        assert!(args.force);
    }

    #[test]
    fn test_parse_register_args() {
        let cli = RefSyncCli::try_parse_from([
            "refsync",
            "register",
            "2024-code-descriptions-cm.zip",
            "--category",
            "ICD10",
            "--date",
            "2023-10-01",
            "--version",
            "2024",
        ])
        .expect("parse");

        let RefSyncSubcommand::Register(args) = cli.command else {
            panic!("expected register");
        };
        assert_eq!(args.category, Category::Icd10);
        assert_eq!(args.date, NaiveDate::from_ymd_opt(2023, 10, 1).expect("date"));
        assert_eq!(args.version_label, "2024");
    }

    #[test]
    fn test_unknown_category_is_rejected() {
        let result =
            RefSyncCli::try_parse_from(["refsync", "status", "--category", "LOINC"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_json_output_uses_category_labels() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).expect("date");
        let artifact = Artifact {
            path: PathBuf::from("/drops/ep_ec_only_cms_20240101.xml.zip"),
            filename: "ep_ec_only_cms_20240101.xml.zip".to_string(),
            category: Category::CqmValueset,
            detected_version: Some("Standard".to_string()),
            detected_date: Some(date),
            flags: refsync_core::FormatFlags::default(),
            checksum: "ab12".to_string(),
        };
        let json = artifact_json(&artifact);
        assert_eq!(json["category"], "CQM_VALUESET");
        assert_eq!(json["release_date"], "2024-01-01");

        let record = TrackingRecord {
            category: Category::Icd10,
            revision_date: None,
            version_label: None,
            checksum: "cd34".to_string(),
            loaded_at: chrono::Utc::now(),
        };
        let json = record_json(&record);
        assert_eq!(json["category"], "ICD10");
        assert!(json["release_date"].is_null());
    }

    #[test]
    fn test_exit_codes() {
        let contention = anyhow::Error::new(RefSyncError::NoWaitContention {
            category: Category::Rxnorm,
            lock_name: "refsync_main_RXNORM".to_string(),
            holder: None,
        });
        assert_eq!(exit_code_for(&contention), EXIT_CONTENTION);

        let fatal = anyhow::Error::new(RefSyncError::MissingLoader {
            category: Category::Rxnorm,
        });
        assert_eq!(exit_code_for(&fatal), EXIT_FAILURE);

        let other = anyhow::anyhow!("not a refsync error");
        assert_eq!(exit_code_for(&other), EXIT_FAILURE);
    }
}
