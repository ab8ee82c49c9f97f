//! CLI entry point for the code search index.
//!
//! Provides commands for training, building, merging and querying a
//! partitioned IVF-PQ index over a JSONL code corpus.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use codesearch_index::display::{
    BuildProgress, create_build_summary_table, create_index_info_table, create_search_table,
    with_spinner,
};
use codesearch_index::vector::{
    BuildState, CorpusReader, DeviceHandle, EncoderContext, FastEmbedFactory, FastEmbedGenerator,
    IdMapping, IndexHandle, IndexLayout, IndexPipeline, IndexWatcher, MergedIndexMeta,
    QueryEngine, QueryService, resolve,
};
use codesearch_index::{IndexError, Settings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Partitioned IVF-PQ index for neural code search
#[derive(Parser)]
#[command(
    name = "codesearch-index",
    version = env!("CARGO_PKG_VERSION"),
    about = "Build and query a partitioned IVF-PQ index over code embeddings",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Quick Start:\n  $ codesearch-index init\n  $ codesearch-index build data/corpus.jsonl --progress\n  $ codesearch-index search \"read a file into a string\" -k 5"
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Index directory (overrides output_dir)
    #[arg(short, long, global = true, env = "CSI_OUTPUT_DIR")]
    output: Option<PathBuf>,

    /// Show detailed logging
    #[arg(long, global = true)]
    info: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    #[command(about = "Set up .codesearch directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    #[command(about = "Display active settings")]
    Config,

    #[command(about = "Write id_mapping.json for a corpus")]
    IdMap {
        /// JSONL corpus (overrides corpus.path)
        corpus: Option<PathBuf>,
    },

    #[command(about = "Train the codebook on the head of the corpus")]
    Train {
        /// JSONL corpus (overrides corpus.path)
        corpus: Option<PathBuf>,
    },

    #[command(about = "Run the whole build: id mapping, training, shards, merge")]
    Build {
        /// JSONL corpus (overrides corpus.path)
        corpus: Option<PathBuf>,

        /// Number of shard workers (overrides build.workers)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Reuse the codebook and any segments that already match
        #[arg(long)]
        resume: bool,

        /// Show progress while building
        #[arg(short, long)]
        progress: bool,
    },

    #[command(about = "Build segments with the existing codebook, without merging")]
    Shards {
        /// JSONL corpus (overrides corpus.path)
        corpus: Option<PathBuf>,

        /// Number of shard workers (overrides build.workers)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Skip partitions whose segment already matches
        #[arg(long)]
        resume: bool,
    },

    #[command(about = "Merge segments into the served index")]
    Merge {
        /// Number of partitions (defaults to the segments on disk)
        #[arg(long)]
        partitions: Option<usize>,
    },

    #[command(about = "Show facts about the merged index")]
    Info,

    #[command(about = "Find the code nearest to a query")]
    Search {
        /// Natural language or code query
        query: Option<String>,

        /// Search with a raw comma-separated vector instead of text
        #[arg(long, value_delimiter = ',', conflicts_with = "query")]
        vector: Option<Vec<f32>>,

        /// Number of results
        #[arg(short)]
        k: Option<usize>,

        /// Cells to probe (overrides search.nprobe)
        #[arg(long)]
        nprobe: Option<usize>,

        /// Output JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    #[command(about = "Answer queries from stdin, reloading when a new index is merged")]
    Serve {
        /// Number of results per query
        #[arg(short)]
        k: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };
    init_tracing(&cli, &settings);

    if let Err(e) = run(cli, settings).await {
        eprintln!("Error: {e:#}");
        if let Some(index_error) = e.downcast_ref::<IndexError>() {
            eprintln!("  [{}]", index_error.status_code());
            for suggestion in index_error.recovery_suggestions() {
                eprintln!("  - {suggestion}");
            }
        }
        std::process::exit(1);
    }
}

/// Logs go to stderr so search output on stdout stays machine readable.
fn init_tracing(cli: &Cli, settings: &Settings) {
    let default_level = if settings.debug {
        "debug"
    } else if cli.info {
        "info"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("codesearch_index={default_level}"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Settings::load().map_err(|e| anyhow!("configuration error: {e}"))?,
    };
    if let Some(output) = &cli.output {
        settings.output_dir = output.clone();
    }
    Ok(settings)
}

fn corpus_reader(settings: &mut Settings, corpus: Option<&PathBuf>) -> Result<CorpusReader> {
    if let Some(path) = corpus {
        settings.corpus.path = Some(path.clone());
    }
    Ok(CorpusReader::from_config(&settings.corpus)?)
}

fn pipeline(settings: Settings) -> Result<IndexPipeline> {
    let factory = Arc::new(FastEmbedFactory::new(settings.model.clone()));
    Ok(IndexPipeline::new(settings, factory)?)
}

fn query_encoder(settings: &Settings) -> Result<EncoderContext> {
    let generator = with_spinner("Loading embedding model...", || {
        FastEmbedGenerator::from_config(&settings.model, false)
    })
    .map_err(|e| IndexError::Encoder(e.to_string()))?;
    Ok(EncoderContext::new(DeviceHandle::Cpu, Arc::new(generator)))
}

fn load_mapping(layout: &IndexLayout) -> Result<Option<IdMapping>> {
    let path = layout.id_mapping();
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(IdMapping::load(&path)?))
}

async fn run(cli: Cli, mut settings: Settings) -> Result<()> {

    match cli.command {
        Commands::Init { force } => {
            let path = Settings::init_config_file(force).map_err(|e| anyhow!("{e}"))?;
            println!("Edit {} to customize your settings.", path.display());
        }

        Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
        }

        Commands::IdMap { corpus } => {
            let reader = corpus_reader(&mut settings, corpus.as_ref())?;
            let pipeline = pipeline(settings)?;
            let mapping = pipeline.write_id_mapping(&reader)?;
            println!(
                "Wrote {} ids to {}",
                mapping.len(),
                pipeline.layout().id_mapping().display()
            );
        }

        Commands::Train { corpus } => {
            let reader = corpus_reader(&mut settings, corpus.as_ref())?;
            let mut pipeline = pipeline(settings)?;
            let codebook =
                with_spinner("Training codebook...", || pipeline.train(reader.texts()?))?;
            println!(
                "Trained codebook {} ({} cells) at {}",
                codebook.fingerprint(),
                codebook.cell_count(),
                pipeline.layout().codebook().display()
            );
        }

        Commands::Build {
            corpus,
            workers,
            resume,
            progress,
        } => {
            let reader = corpus_reader(&mut settings, corpus.as_ref())?;
            if let Some(workers) = workers {
                settings.build.workers = workers;
            }
            settings.build.resume |= resume;

            let tracker = if progress {
                BuildProgress::new("building segments")
            } else {
                BuildProgress::hidden()
            };
            let recorder = tracker.clone();
            let mut pipeline = pipeline(settings)?.with_progress(move |o| recorder.record(o));
            let report = pipeline.run(&reader)?;
            tracker.finish_with_message("done");

            println!("{}", create_build_summary_table(&report));
            println!("Index written to {}", pipeline.layout().root().display());
        }

        Commands::Shards {
            corpus,
            workers,
            resume,
        } => {
            let reader = corpus_reader(&mut settings, corpus.as_ref())?;
            if let Some(workers) = workers {
                settings.build.workers = workers;
            }
            settings.build.resume |= resume;

            let mut pipeline = pipeline(settings)?.resume_at(BuildState::Trained);
            let codebook = pipeline.load_codebook()?;
            let segments = pipeline.build_shards(codebook, reader.texts()?)?;
            let reused = segments.iter().filter(|s| s.reused).count();
            println!(
                "{} segments ready ({reused} reused); run 'merge' to publish them",
                segments.len()
            );
        }

        Commands::Merge { partitions } => {
            let mut pipeline = pipeline(settings)?.resume_at(BuildState::ShardsComplete);
            let codebook = pipeline.load_codebook()?;
            let partitions = match partitions {
                Some(p) => p,
                None => pipeline.partitions_on_disk()?,
            };
            if partitions == 0 {
                bail!("no segments found in {}", pipeline.layout().root().display());
            }
            let meta = with_spinner("Merging segments...", || pipeline.merge(codebook, partitions))?;
            println!("{}", create_index_info_table(&meta));
        }

        Commands::Info => {
            let layout = IndexLayout::new(&settings.output_dir);
            println!("State: {}", BuildState::detect(&layout));
            if layout.merged_meta().exists() {
                let meta = MergedIndexMeta::load(&layout.merged_meta())?;
                println!("{}", create_index_info_table(&meta));
            }
        }

        Commands::Search {
            query,
            vector,
            k,
            nprobe,
            json,
        } => {
            let k = k.unwrap_or(settings.search.default_k);
            let layout = IndexLayout::new(&settings.output_dir);
            let engine = QueryEngine::load(layout.root(), settings.search.nprobe)?;
            let mapping = load_mapping(&layout)?;
            if let Some(mapping) = &mapping {
                engine.check_mapping(mapping)?;
            }

            let query = match (query, vector) {
                (_, Some(vector)) => vector,
                (Some(text), None) => query_encoder(&settings)?
                    .encode_batch(&[text.as_str()], None)?
                    .pop()
                    .context("encoder returned no vector")?,
                (None, None) => bail!("provide a query or --vector"),
            };

            let hits = resolve(&engine.search(&query, k, nprobe)?, mapping.as_ref());
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                println!("{}", create_search_table(&hits));
            }
        }

        Commands::Serve { k } => {
            let k = k.unwrap_or(settings.search.default_k);
            serve(&settings, k).await?;
        }
    }
    Ok(())
}

async fn serve(settings: &Settings, k: usize) -> Result<()> {
    let layout = IndexLayout::new(&settings.output_dir);
    let handle = Arc::new(IndexHandle::open(layout.root(), settings.search.nprobe)?);
    let service = QueryService::new(Arc::clone(&handle), query_encoder(settings)?)
        .with_mapping_from(&layout.id_mapping())?;

    let watcher = IndexWatcher::new(
        Arc::clone(&handle),
        Duration::from_secs(settings.search.watch_interval.max(1)),
    );
    tokio::spawn(watcher.watch());

    info!("Serving {}", layout.root().display());
    eprintln!("Enter one query per line, Ctrl-D to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        match service.search_text(query, k) {
            Ok(hits) => println!("{}", serde_json::to_string(&hits)?),
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    Ok(())
}
