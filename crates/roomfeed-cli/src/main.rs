use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use roomfeed_adapters::{adapter_for, CommandClassifier, SearchSpec, SourceRegistry};
use roomfeed_core::{CurationStatus, RoomType};
use roomfeed_pipeline::{
    classify_visual, export_json, reclassify_text, DedupEngine, DownloadManager, DownloadOutcome,
    ExportFilters, IngestCoordinator, PipelineConfig,
};
use roomfeed_storage::{DownloadFilter, FileStore, HttpFetcher, ImageStore};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "roomfeed")]
#[command(about = "Interior image ingestion, dedup, and curation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull candidates from a configured source into the database.
    Scrape {
        /// Source id from the sources registry.
        source: String,
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        room_type: Option<String>,
        /// Maximum candidates to pull; 0 pulls until the source is exhausted.
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Download image files for stored records.
    Download {
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Fetch again even when a local file is already recorded.
        #[arg(long)]
        redownload: bool,
    },
    /// Fingerprint downloaded images and group near-duplicates.
    Dedup {
        /// Hamming distance threshold, 0..=64.
        #[arg(long)]
        threshold: Option<u32>,
        /// Report groups without rejecting anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-run keyword classification, or a visual pass via an external model.
    Classify {
        /// Reclassify every record, not just unclassified ones.
        #[arg(long)]
        reprocess: bool,
        /// Classify downloaded image bytes through this executable instead
        /// of the stored text (stdin: image, stdout: classification JSON).
        #[arg(long, value_name = "PROGRAM")]
        visual: Option<PathBuf>,
    },
    /// Approve, reject, or re-open a record.
    Curate {
        id: i64,
        action: CurateAction,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Print collection statistics.
    Stats,
    /// Export records as JSON, approved only unless --all.
    Export {
        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        room_type: Option<String>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        min_quality: Option<f64>,
        #[arg(long)]
        all: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CurateAction {
    Approve,
    Reject,
    Pending,
}

fn parse_room(value: Option<String>) -> Result<Option<RoomType>> {
    value
        .map(|text| {
            RoomType::parse(&text).with_context(|| {
                let known: Vec<&str> = RoomType::ALL.iter().map(|r| r.as_str()).collect();
                format!("unknown room type {text:?}; expected one of {}", known.join(", "))
            })
        })
        .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let store = ImageStore::open(&config.database_path).await?;

    match cli.command {
        Commands::Scrape {
            source,
            query,
            room_type,
            limit,
        } => {
            let registry = SourceRegistry::load(&config.sources_path)?;
            let source_config = registry
                .find(&source)
                .with_context(|| format!("source {source:?} is not in the registry"))?;
            if !source_config.enabled {
                bail!("source {source:?} is disabled in the registry");
            }
            let adapter = adapter_for(source_config)?;
            let spec = SearchSpec {
                query,
                room_type: parse_room(room_type)?,
                limit,
            };

            let http = Arc::new(HttpFetcher::new(config.http_config())?);
            let coordinator = IngestCoordinator::new(store, http);
            let stop = AtomicBool::new(false);
            let run = coordinator.run(adapter.as_ref(), &spec, &stop).await?;

            println!(
                "run {}: status={} found={} new={}",
                run.id,
                run.status.as_str(),
                run.images_found,
                run.images_new
            );
            if let Some(error) = run.error {
                bail!("scrape failed: {error}");
            }
        }
        Commands::Download {
            source,
            concurrency,
            redownload,
        } => {
            let records = store
                .images_for_download(&DownloadFilter {
                    source,
                    only_missing: !redownload,
                    ..Default::default()
                })
                .await?;
            let http = Arc::new(HttpFetcher::new(config.http_config())?);
            let manager = DownloadManager::new(store, FileStore::new(&config.image_root), http);
            let outcomes = manager
                .download_batch(
                    records,
                    concurrency.unwrap_or(config.download_concurrency),
                    redownload,
                )
                .await;

            let mut downloaded = 0;
            let mut skipped = 0;
            let mut failed = 0;
            for outcome in outcomes.values() {
                match outcome {
                    DownloadOutcome::Downloaded { .. } => downloaded += 1,
                    DownloadOutcome::Skipped { .. } => skipped += 1,
                    DownloadOutcome::Failed { .. } => failed += 1,
                }
            }
            println!("downloaded={downloaded} skipped={skipped} failed={failed}");
            for (id, outcome) in &outcomes {
                if let DownloadOutcome::Failed { error, permanent } = outcome {
                    println!("  image {id}: {error} (permanent: {permanent})");
                }
            }
        }
        Commands::Dedup { threshold, dry_run } => {
            let threshold = threshold.unwrap_or(config.dedup_threshold);
            let engine = DedupEngine::new(store);
            let fingerprinted = engine.fingerprint_missing().await?;
            println!("fingerprinted {fingerprinted} new images");

            if dry_run {
                let groups = engine.dry_run(threshold).await?;
                println!("{} duplicate group(s) at threshold {threshold} (dry run)", groups.len());
                for group in groups {
                    let ids: Vec<String> =
                        group.duplicates.iter().map(|r| r.id.to_string()).collect();
                    println!("  keep {} / reject {}", group.survivor.id, ids.join(", "));
                }
            } else {
                let (groups, report) = engine.mark_duplicates(threshold).await?;
                println!(
                    "{} group(s), {} image(s) rejected at threshold {threshold}",
                    report.groups, report.marked
                );
                for group in groups {
                    let ids: Vec<String> =
                        group.duplicates.iter().map(|r| r.id.to_string()).collect();
                    println!("  kept {} over {}", group.survivor.id, ids.join(", "));
                }
            }
        }
        Commands::Classify { reprocess, visual } => {
            let report = match visual {
                Some(program) => {
                    let classifier = CommandClassifier::new(program);
                    classify_visual(&store, &classifier, reprocess).await?
                }
                None => reclassify_text(&store, reprocess).await?,
            };
            println!(
                "examined={} updated={} skipped={}",
                report.examined, report.updated, report.skipped
            );
        }
        Commands::Curate { id, action, notes } => {
            let status = match action {
                CurateAction::Approve => CurationStatus::Approved,
                CurateAction::Reject => CurationStatus::Rejected,
                CurateAction::Pending => CurationStatus::Pending,
            };
            let record = store.set_status(id, status, notes.as_deref()).await?;
            println!("image {} -> {}", record.id, record.status);
        }
        Commands::Stats => {
            let stats = store.stats().await?;
            println!("total images: {}", stats.total);
            println!("downloaded:   {}", stats.downloaded);
            println!("approved:     {} ({} downloaded)", stats.approved, stats.approved_downloaded);
            println!("by source:");
            for (source, count) in &stats.by_source {
                println!("  {source}: {count}");
            }
            println!("by room type:");
            for (room, count) in &stats.by_room_type {
                println!("  {room}: {count}");
            }
            println!("by status:");
            for (status, count) in &stats.by_status {
                println!("  {status}: {count}");
            }
        }
        Commands::Export {
            output,
            room_type,
            source,
            min_quality,
            all,
        } => {
            let filters = ExportFilters {
                status: (!all).then_some(CurationStatus::Approved),
                room_type: parse_room(room_type)?,
                source,
                min_quality,
            };
            let text = export_json(&store, &filters).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &text)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("wrote {}", path.display());
                }
                None => println!("{text}"),
            }
        }
    }

    Ok(())
}
