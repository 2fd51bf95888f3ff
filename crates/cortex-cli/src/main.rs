//! cortex: operator tool for a local cortex data directory.
//!
//! The data directory holds `fast.json` (the capacity-limited fast store),
//! `objects/` (the object store) and, unless `--export-dir` is given,
//! `export/` as the folder export target.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cortex_store::{
    DirectoryTargetProvider, FileFastStore, FilesystemObjectStore, RecordKind, StorageConfig,
    StorageFacade,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cortex")]
#[command(author, version, about = "Tiered storage maintenance for cortex")]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory
    #[arg(short, long, default_value = ".cortex")]
    data_dir: PathBuf,

    /// Export folder (default: <data-dir>/export)
    #[arg(long)]
    export_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show fast-store usage and the largest entries
    Usage {
        /// Number of entries to show
        #[arg(short, long, default_value_t = 10)]
        top: usize,
    },

    /// List stored records
    List {
        /// Only this kind (document, visual, settings, note, idea, chat)
        #[arg(short, long)]
        kind: Option<RecordKind>,
    },

    /// Print one record as JSON
    Get { id: String },

    /// Delete one record from every tier
    Delete { id: String },

    /// Search record text
    Search { query: String },

    /// Mirror notes and ideas into the export folder
    Export,

    /// Write a timestamped backup bundle into the export folder
    Backup,

    /// Import notes and ideas from a bundle file
    Import { file: PathBuf },

    /// Fold legacy registries into the canonical registry
    Migrate,

    /// Run every eviction pass now
    Cleanup,

    /// Show the version history ledger
    History,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

// LOG_FORMAT is "json" or "text" (default); RUST_LOG filters as usual.
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cortex_store=info,cortex_core=info,cortex=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn open_facade(data_dir: &Path, export_dir: Option<PathBuf>) -> anyhow::Result<StorageFacade> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    // One-shot commands do not need the periodic monitor.
    let config = StorageConfig::from_env().with_monitor_interval(Duration::ZERO);
    let fast = FileFastStore::open(data_dir.join("fast.json"), config.capacity_bytes)
        .context("opening fast store")?;
    let objects = FilesystemObjectStore::new(data_dir.join("objects"));
    let export_root = export_dir.unwrap_or_else(|| data_dir.join("export"));

    let facade = StorageFacade::open(
        config,
        Arc::new(fast),
        Arc::new(objects),
        Arc::new(DirectoryTargetProvider::new(export_root)),
    )
    .await
    .context("opening storage")?;
    Ok(facade)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let facade = open_facade(&cli.data_dir, cli.export_dir).await?;

    match cli.command {
        Commands::Usage { top } => {
            let usage = facade.usage()?;
            let level = facade.check_capacity()?.level;
            println!(
                "{} / {} bytes used ({level})",
                usage.bytes_used, usage.capacity_bytes
            );
            for (key, size) in usage.largest(top) {
                println!("{size:>12}  {key}");
            }
        }
        Commands::List { kind } => {
            for record in facade.list(kind).await? {
                println!(
                    "{:<10} {:<40} {}",
                    record.kind(),
                    record.id(),
                    record.title().unwrap_or("")
                );
            }
        }
        Commands::Get { id } => match facade.load(&id).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => anyhow::bail!("record {id} not found"),
        },
        Commands::Delete { id } => {
            if !facade.delete(&id).await? {
                anyhow::bail!("record {id} not found");
            }
            println!("deleted {id}");
        }
        Commands::Search { query } => {
            for hit in facade.search(&query).await? {
                println!("{:<10} {:<40} {}", hit.kind, hit.id, hit.snippet);
            }
        }
        Commands::Export => {
            let report = facade.export_all().await?;
            println!(
                "wrote {} files to {}",
                report.files.len(),
                report.root.display()
            );
        }
        Commands::Backup => {
            let bundle = facade.build_bundle().await?;
            let path = facade.folder().write_backup(&bundle).await?;
            println!("backup written to {}", path.display());
        }
        Commands::Import { file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let summary = facade.import_bundle(&bytes).await?;
            println!(
                "imported {} notes and {} ideas",
                summary.notes_count, summary.ideas_count
            );
        }
        Commands::Migrate => {
            let report = facade.reconcile_legacy().await?;
            println!(
                "scanned {}, collapsed {} duplicates, migrated {}, already present {}",
                report.scanned,
                report.duplicates_collapsed,
                report.migrated.len(),
                report.already_present.len()
            );
            for (owner, error) in &report.failed {
                eprintln!("failed {owner}: {error}");
            }
            if !report.is_clean() {
                anyhow::bail!("{} legacy owners failed to migrate", report.failed.len());
            }
        }
        Commands::Cleanup => {
            let freed = facade.run_eviction();
            info!(bytes_freed = freed, "Manual cleanup finished");
            println!("freed {freed} bytes");
        }
        Commands::History => {
            for entry in facade.version_history()? {
                println!(
                    "{}  {:<6} {:<10} {}",
                    entry.timestamp.to_rfc3339(),
                    entry.action,
                    entry.entity_kind,
                    entry.entity_id
                );
            }
        }
    }

    facade.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_parses_kind_filter() {
        let cli = parse(&["cortex", "list", "--kind", "notes"]);
        match cli.command {
            Commands::List { kind } => assert_eq!(kind, Some(RecordKind::Note)),
            _ => panic!("expected list"),
        }
        assert_eq!(cli.data_dir, PathBuf::from(".cortex"));
    }

    #[test]
    fn test_rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["cortex", "list", "--kind", "spaceship"]).is_err());
    }

    #[tokio::test]
    async fn test_import_then_export_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let bundle = dir.path().join("bundle.json");
        std::fs::write(
            &bundle,
            r#"{"notes":[{"id":"n1","title":"Hello","content":"world"}],"ideas":[]}"#,
        )
        .unwrap();

        let data_arg = data.to_str().unwrap();
        let bundle_arg = bundle.to_str().unwrap();
        run(parse(&["cortex", "-d", data_arg, "import", bundle_arg]))
            .await
            .unwrap();
        run(parse(&["cortex", "-d", data_arg, "export"])).await.unwrap();

        assert!(data.join("fast.json").is_file());
        assert!(data.join("export/notes/Hello.md").is_file());

        let err = run(parse(&["cortex", "-d", data_arg, "get", "missing"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
