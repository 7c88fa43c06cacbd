use anyhow::Context;
use clap::{Parser, Subcommand};
use half::f16;
use semdex_context::ChunkType;
use semdex_retriever::retrieval::source::discover;
use semdex_retriever::{
    IndexManager, IndexingEngineConfig, JobType, ProcessingJob, QueryFilter, SearchResult,
    SourceFile,
};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Index a repository for semantic search and query the index.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with the indexing configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Repository root; overrides `base_path` from the config file
    #[arg(short, long, global = true)]
    base_dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "summary")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index the repository
    Index {
        /// Only re-index the given changed files (deleted files are removed)
        #[arg(long, requires = "files")]
        incremental: bool,
        /// Files to index; defaults to every file under the repository root
        /// unless --incremental is set
        files: Vec<PathBuf>,
    },
    /// Search the index by text or by a raw embedding
    Search {
        /// Text query, embedded with the configured provider
        query: Option<String>,
        /// Query embedding values (comma-separated floats)
        #[arg(long, value_delimiter = ',', conflicts_with = "query")]
        embedding: Vec<f32>,
        /// Maximum number of results
        #[arg(short = 'k', long, default_value_t = 10)]
        limit: usize,
        /// Only chunks of this language
        #[arg(long)]
        language: Option<String>,
        /// Only chunks of this type (function, class, import, comment, code)
        #[arg(long = "type")]
        chunk_type: Option<ChunkType>,
        /// Only files under this relative path prefix
        #[arg(long)]
        path_prefix: Option<String>,
    },
    /// List jobs of the repository
    Jobs,
    /// Show one job
    Job {
        /// Job id
        id: Uuid,
    },
    /// Show index statistics
    Stats,
    /// Run a summary job and show its result
    Summary,
    /// Remove records of files that no longer exist
    Cleanup,
    /// Re-embed every record with the configured provider
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn load_config(args: &Args) -> anyhow::Result<IndexingEngineConfig> {
    let mut config = match &args.config {
        Some(path) => IndexingEngineConfig::from_toml_file(path)?,
        None => {
            let base = args.base_dir.clone().unwrap_or_else(|| PathBuf::from("."));
            let name = std::fs::canonicalize(&base)
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                .unwrap_or_else(|| "repository".to_string());
            IndexingEngineConfig::new(name, base)
        }
    };
    if let (Some(_), Some(base)) = (&args.config, &args.base_dir) {
        config.base_path = base.clone();
    }
    Ok(config)
}

fn source_files(root: &Path, paths: &[PathBuf], max_file_bytes: u64) -> Vec<SourceFile> {
    if paths.is_empty() {
        return discover(root, max_file_bytes);
    }
    paths
        .iter()
        .map(|path| {
            let absolute = if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            };
            SourceFile::under(root, absolute)
        })
        .collect()
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let root = config.base_path.clone();
    let max_file_bytes = config.max_file_bytes;

    let manager = IndexManager::from_config(config).await?;
    let repo = manager
        .register_repository(&root, None, None)
        .await
        .context("Failed to register repository")?;

    match args.command {
        Commands::Index { incremental, files } => {
            let job_type = if incremental {
                JobType::IncrementalUpdate
            } else {
                JobType::FullIndex
            };
            let files = source_files(&root, &files, max_file_bytes);
            let job_id = manager.start_job(&repo.id, job_type, files).await?;
            let job = manager.wait(job_id).await?;
            print_job(&job, args.format)?;
        }
        Commands::Search {
            query,
            embedding,
            limit,
            language,
            chunk_type,
            path_prefix,
        } => {
            let filter = QueryFilter {
                language,
                chunk_type,
                path_prefix,
            };
            let results = match query {
                Some(query) => manager.search_text(&query, limit, &filter).await?,
                None => {
                    if embedding.is_empty() {
                        anyhow::bail!("Provide a text query or --embedding");
                    }
                    let vector: Vec<f16> = embedding.iter().map(|&x| f16::from_f32(x)).collect();
                    manager.search(&vector, limit, &filter).await?
                }
            };
            print_results(&results, args.format)?;
        }
        Commands::Jobs => {
            let jobs = manager.list_jobs(Some(&repo.id)).await?;
            match args.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Summary => {
                    println!("Found {} jobs:", jobs.len());
                    for job in jobs {
                        println!(
                            "  {} | {} | {} | {:.0}% | {} errors",
                            job.id,
                            job.job_type,
                            job.status,
                            job.progress.percentage,
                            job.errors.len()
                        );
                    }
                }
            }
        }
        Commands::Job { id } => {
            let job = manager.get_job(id).await?;
            print_job(&job, args.format)?;
        }
        Commands::Stats => {
            let stats = manager.stats().await?;
            match args.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Summary => {
                    println!("Index Statistics:");
                    println!("  Records: {}", stats.records);
                    println!("  Files: {}", stats.files);
                    println!("  Truncated: {}", stats.truncated);
                    for (language, count) in &stats.by_language {
                        println!("  Language {language}: {count}");
                    }
                    for (chunk_type, count) in &stats.by_chunk_type {
                        println!("  Type {chunk_type}: {count}");
                    }
                    for (provider, count) in &stats.by_provider {
                        println!("  Provider {provider}: {count}");
                    }
                }
            }
        }
        Commands::Summary => {
            let job_id = manager
                .start_job(&repo.id, JobType::SummaryGeneration, Vec::new())
                .await?;
            let job = manager.wait(job_id).await?;
            match (args.format, &job.summary) {
                (OutputFormat::Json, Some(summary)) => {
                    println!("{}", serde_json::to_string_pretty(summary)?)
                }
                _ => print_job(&job, args.format)?,
            }
        }
        Commands::Cleanup => {
            let files = discover(&root, max_file_bytes);
            let job_id = manager.start_job(&repo.id, JobType::Cleanup, files).await?;
            let job = manager.wait(job_id).await?;
            print_job(&job, args.format)?;
        }
        Commands::Migrate => {
            let job_id = manager
                .start_job(&repo.id, JobType::ProviderMigration, Vec::new())
                .await?;
            let job = manager.wait(job_id).await?;
            print_job(&job, args.format)?;
        }
    }
    Ok(())
}

fn print_job(job: &ProcessingJob, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(job)?);
        return Ok(());
    }

    let progress = &job.progress;
    println!("Job {} ({})", job.id, job.job_type);
    println!("  Status: {}", job.status);
    println!("  Provider: {}", job.provider);
    println!(
        "  Files: {}/{} processed, {} skipped, {} degraded",
        progress.files_processed, progress.files_total, progress.files_skipped, progress.files_degraded
    );
    println!(
        "  Chunks: {} total, {} embedded, {} reused",
        progress.chunks_total, progress.chunks_embedded, progress.chunks_reused
    );
    if let Some(fatal) = &job.fatal_error {
        println!("  Fatal: [{}] {}", fatal.code, fatal.message);
    }
    if !job.errors.is_empty() {
        println!("  Errors ({}):", job.errors.len());
        for error in job.errors.iter().take(10) {
            match &error.file {
                Some(file) => println!("    [{}] {}: {}", error.code, file, error.message),
                None => println!("    [{}] {}", error.code, error.message),
            }
        }
        if job.errors.len() > 10 {
            println!("    ... and {} more", job.errors.len() - 10);
        }
    }
    if let Some(summary) = &job.summary {
        println!("  Records: {} in {} files", summary.records, summary.files);
        for (language, count) in &summary.by_language {
            println!("    {language}: {count}");
        }
        println!("  Providers: {}", summary.providers.join(", "));
    }
    Ok(())
}

fn print_results(results: &[SearchResult], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(results)?),
        OutputFormat::Summary => {
            println!("Found {} similar chunks:", results.len());
            for result in results {
                println!(
                    "  {:.3} | {}:{}-{} | {} | {}",
                    result.score,
                    result.file,
                    result.line_range.0,
                    result.line_range.1,
                    result.chunk_type,
                    result.names.join(", ")
                );
                println!("    {}", result.relevance_explanation);
            }
        }
    }
    Ok(())
}
