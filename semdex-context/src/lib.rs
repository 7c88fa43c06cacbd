//! Language-aware source analysis and chunking.
//!
//! Raw file text goes in, an ordered list of [`TextChunk`]s comes out,
//! together with the [`Symbol`]s and [`Relationship`]s the analyzer found.
//!
//! - [`language`]: language tags and detection
//! - [`analyzer`]: the [`LanguageAnalyzer`] family and its registry
//! - [`chunker`]: declaration-driven chunking with context lines
//! - [`text`]: the chunk model and the paragraph splitter for prose

pub mod analyzer;
pub mod chunker;
pub mod error;
pub mod language;
pub mod text;
pub mod unit;

pub use analyzer::{Analysis, AnalyzerRegistry, LanguageAnalyzer, analyze};
pub use chunker::{ChunkedFile, Chunker, ChunkerConfig, chunk_source};
pub use error::{AnalysisError, Result};
pub use language::detect_language;
pub use text::{ChunkType, TextChunk, estimate_tokens};
pub use unit::{Relationship, SourceNode, SourceUnit, Symbol, SymbolKind};
