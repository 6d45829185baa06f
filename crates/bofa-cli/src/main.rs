use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bofa_core::{Browser, RawRelease, ReleaseRecord};
use bofa_feed::MergeOutcome;
use bofa_storage::{export_json, export_yaml, snapshot_paths, XmlDocument};
use bofa_sync::{
    export_feed_snapshots, merge_release, FeedEntry, FeedRegistry, SyncConfig, SyncPipeline,
};
use clap::{Args, Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "bofa-cli")]
#[command(about = "Browser feed aggregator: merge vendor release snapshots into RSS feeds")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge every enabled browser's snapshot into its feed.
    Sync(SyncArgs),
    /// Merge a single release given on the command line.
    Merge(MergeArgs),
    /// Convert an XML document to JSON and YAML.
    Export(ExportArgs),
}

#[derive(Debug, Args, Default)]
struct SyncArgs {
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[arg(long)]
    browser: Browser,
    #[arg(long)]
    version: String,
    #[arg(long)]
    download_url: String,
    #[arg(long)]
    last_updated: Option<String>,
    /// Feed path relative to the workspace root; defaults to the browser's feed.
    #[arg(long)]
    feed: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ExportArgs {
    xml: PathBuf,
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let builder = tracing_subscriber::registry().with(filter);

    match std::env::var("BOFA_LOG_FORMAT").as_deref() {
        Ok("json") => {
            let _ = builder.with(fmt_layer.json().flatten_event(true)).try_init();
        }
        _ => {
            let _ = builder.with(fmt_layer.compact()).try_init();
        }
    }
}

fn run_sync(args: SyncArgs) -> Result<()> {
    let summary = bofa_sync::run_sync_once_from_env()?;
    if args.json {
        println!("{}", summary.to_json_pretty()?);
    } else {
        println!(
            "sync complete: run_id={} inserted={} updated={} skipped={} failed={}",
            summary.run_id, summary.inserted, summary.updated, summary.skipped, summary.failed
        );
    }
    Ok(())
}

fn run_merge(args: MergeArgs) -> Result<()> {
    let config = SyncConfig::from_env();
    let registry = FeedRegistry::load_or_builtin(config.feeds_path())?;
    let entry = registry
        .feeds
        .iter()
        .find(|entry| entry.browser == args.browser)
        .cloned()
        .unwrap_or_else(|| FeedEntry::builtin(args.browser));

    let record = ReleaseRecord::from_raw(
        entry.feed_config(),
        &RawRelease {
            short_version: Some(args.version),
            update_download: Some(args.download_url),
            last_updated: args.last_updated,
        },
    )?;
    let feed_path = args.feed.unwrap_or_else(|| entry.feed_path());

    let pipeline = SyncPipeline::new(config);
    let applied = merge_release(pipeline.store(), pipeline.engine(), &record, &feed_path)?;
    if pipeline.config().export_snapshots {
        export_feed_snapshots(&applied.document, &applied.stored.path)?;
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&applied.report).context("serializing merge report")?
        );
    } else {
        let action = match applied.report.outcome {
            MergeOutcome::Inserted => "inserted",
            MergeOutcome::Updated { .. } => "updated",
        };
        println!(
            "{action} {} {} in {}",
            record.name(),
            record.version,
            applied.stored.path.display()
        );
    }
    Ok(())
}

fn run_export(args: ExportArgs) -> Result<()> {
    let text = fs::read_to_string(&args.xml)
        .with_context(|| format!("reading {}", args.xml.display()))?;
    let document =
        XmlDocument::parse(&text).with_context(|| format!("parsing {}", args.xml.display()))?;

    let (json_path, yaml_path) = match &args.out_dir {
        Some(dir) => {
            let file_name = args
                .xml
                .file_name()
                .with_context(|| format!("{} has no file name", args.xml.display()))?;
            snapshot_paths(&dir.join(file_name))
        }
        None => snapshot_paths(&args.xml),
    };
    export_json(&document, &json_path)?;
    export_yaml(&document, &yaml_path)?;
    println!("wrote {} and {}", json_path.display(), yaml_path.display());
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Sync(SyncArgs::default()));
    info!(?command, "bofa-cli starting");
    match command {
        Commands::Sync(args) => run_sync(args),
        Commands::Merge(args) => run_merge(args),
        Commands::Export(args) => run_export(args),
    }
}
