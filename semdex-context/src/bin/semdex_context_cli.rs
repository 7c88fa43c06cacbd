use anyhow::Context;
use clap::Parser;
use semdex_context::{AnalyzerRegistry, Chunker, ChunkerConfig, chunk_source};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use tracing_subscriber::EnvFilter;

/// Analyze one source file and print its chunks, symbols and relationships as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Repository name recorded on each chunk.
    #[arg(short, long, default_value = "unknown_repo")]
    repo: String,

    /// Repository-relative path, used for language detection and passages.
    #[arg(short, long)]
    path: Option<String>,

    /// Language tag to use instead of detection (e.g. general-code, flow, java).
    #[arg(short, long)]
    language: Option<String>,

    /// Maximum estimated tokens per chunk.
    #[arg(short, long, default_value_t = 512)]
    max_tokens: usize,

    /// Lines of context kept before and after each chunk.
    #[arg(short, long, default_value_t = 3)]
    context_lines: usize,
}

#[derive(Serialize)]
struct PassageView<'a> {
    #[serde(flatten)]
    chunk: &'a semdex_context::TextChunk,
    passage: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let content = match &args.input {
        Some(input) => {
            fs::read_to_string(input).with_context(|| format!("Failed to read {input}"))?
        }
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let path = args
        .path
        .clone()
        .or_else(|| args.input.clone())
        .unwrap_or_else(|| "stdin".to_string());

    let chunker = Chunker::new(
        ChunkerConfig::new(args.repo)
            .with_max_tokens(args.max_tokens)
            .with_context_lines(args.context_lines),
    );
    let registry = AnalyzerRegistry::with_defaults();
    let file = chunk_source(
        &registry,
        &chunker,
        args.input.as_deref().unwrap_or(&path),
        &path,
        &content,
        args.language.as_deref(),
    )?;

    let passages: Vec<PassageView> = file
        .chunks
        .iter()
        .map(|chunk| PassageView {
            chunk,
            passage: chunk.build(),
        })
        .collect();

    let output = serde_json::json!({
        "language": file.language,
        "chunks": passages,
        "symbols": file.symbols,
        "relationships": file.relationships,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
