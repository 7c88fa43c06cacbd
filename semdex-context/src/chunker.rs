//! Turns an analysis into an ordered, non-overlapping sequence of chunks.
//!
//! Top-level declarations become `function`/`class` chunks. Whatever lies
//! between them is grouped into `import`, `comment` and `code` chunks.
//! Everything is bounded by [`ChunkerConfig::max_tokens`]; oversized ranges
//! are split on statement boundaries without cutting lines.

use crate::analyzer::{Analysis, AnalyzerRegistry, analyze};
use crate::error::Result;
use crate::language::{self, detect_language};
use crate::text::{ChunkType, ParagraphSplitter, TextChunk, estimate_tokens, pack_lines};
use crate::unit::{MODULE_SCOPE, Relationship, Symbol, SymbolKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

static IMPORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(import\s|from\s+\S+\s+import\s|use\s|using\s|#include\b|@import\s|require\s|extern\s+crate\s|(const|let|var)\s+[\w{}, ]+\s*=\s*require\()",
    )
    .expect("import pattern is valid")
});

/// Chunker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Repository name recorded on every chunk
    pub repo: String,
    /// Upper bound on `estimate_tokens(content)` per chunk
    pub max_tokens: usize,
    /// Lines of surrounding context kept before and after each chunk
    pub context_lines: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            repo: "repository".to_string(),
            max_tokens: 512,
            context_lines: 3,
        }
    }
}

impl ChunkerConfig {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    pub fn with_context_lines(mut self, context_lines: usize) -> Self {
        self.context_lines = context_lines;
        self
    }
}

/// Chunks plus the analysis results they were derived from.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkedFile {
    pub language: String,
    pub chunks: Vec<TextChunk>,
    pub symbols: Vec<Symbol>,
    pub relationships: Vec<Relationship>,
}

/// Lines of a file with their byte offsets.
struct FileLines<'a> {
    text: Vec<&'a str>,
    starts: Vec<usize>,
}

impl<'a> FileLines<'a> {
    fn new(source: &'a str) -> Self {
        let mut text = Vec::new();
        let mut starts = Vec::new();
        let mut offset = 0;
        for piece in source.split_inclusive('\n') {
            starts.push(offset);
            offset += piece.len();
            text.push(piece.trim_end_matches('\n').trim_end_matches('\r'));
        }
        Self { text, starts }
    }

    fn len(&self) -> usize {
        self.text.len()
    }

    fn join(&self, start: usize, end: usize) -> String {
        self.text[start - 1..end].join("\n")
    }

    fn byte_range(&self, start: usize, end: usize) -> (usize, usize) {
        (self.starts[start - 1], self.starts[end - 1] + self.text[end - 1].len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineClass {
    Blank,
    Import,
    Comment,
    Code,
}

fn is_comment(trimmed: &str) -> bool {
    trimmed.starts_with("//")
        || trimmed.starts_with("/*")
        || trimmed.starts_with('*')
        || trimmed.starts_with("--")
        || trimmed.starts_with("<!--")
        || trimmed.starts_with("#!")
        || trimmed == "#"
        || trimmed.starts_with("# ")
        || trimmed.starts_with("\"\"\"")
}

/// Classify residual lines, following multi-line block comments.
fn classify_lines(lines: &[&str]) -> Vec<LineClass> {
    let mut in_block = false;
    lines
        .iter()
        .map(|line| {
            let trimmed = line.trim();
            if in_block {
                if trimmed.contains("*/") {
                    in_block = false;
                }
                return LineClass::Comment;
            }
            if trimmed.is_empty() {
                LineClass::Blank
            } else if trimmed.starts_with("/*") {
                in_block = !trimmed.contains("*/");
                LineClass::Comment
            } else if IMPORT_LINE.is_match(line) {
                LineClass::Import
            } else if is_comment(trimmed) {
                LineClass::Comment
            } else {
                LineClass::Code
            }
        })
        .collect()
}

/// Whether a line ends a statement and is a good place to split.
fn ends_statement(line: &str) -> bool {
    let trimmed = line.trim_end();
    trimmed.is_empty() || trimmed.ends_with([';', '}', '{', ':', ')'])
}

/// A planned chunk before content and context are filled in.
#[derive(Debug, Clone)]
struct Planned {
    start: usize,
    end: usize,
    chunk_type: ChunkType,
    function_name: Option<String>,
    class_name: Option<String>,
    carries_context: bool,
}

/// Declaration-driven chunker.
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk a file that an analyzer has already processed.
    pub fn chunk_analysis(
        &self,
        analysis: &Analysis,
        text: &str,
        file_path: &str,
        relative_path: &str,
        language: &str,
    ) -> Vec<TextChunk> {
        let lines = FileLines::new(text);
        let line_count = lines.len();
        if line_count == 0 {
            return Vec::new();
        }

        let declarations = top_level_declarations(&analysis.symbols, line_count);
        let classes = classify_lines(&lines.text);

        let mut planned = Vec::new();
        let mut imports = Vec::new();
        let mut cursor = 1;
        for declaration in &declarations {
            self.plan_residual(&lines, &classes, cursor, declaration.span.start_line - 1, &mut planned, &mut imports);
            self.plan_declaration(&lines, declaration, &mut planned);
            cursor = declaration.span.end_line + 1;
        }
        self.plan_residual(&lines, &classes, cursor, line_count, &mut planned, &mut imports);

        planned.sort_by_key(|p| p.start);
        planned
            .into_iter()
            .filter(|p| p.start <= p.end && p.end <= line_count)
            .enumerate()
            .map(|(sequence, plan)| {
                let references = if plan.carries_context {
                    references_within(&analysis.relationships, plan.start, plan.end)
                } else {
                    Vec::new()
                };
                let imports = if plan.carries_context {
                    imports.clone()
                } else {
                    Vec::new()
                };
                self.materialize(&lines, plan, sequence, file_path, relative_path, language, imports, references)
            })
            .collect()
    }

    /// Chunk a file that has no analyzer.
    pub fn chunk_plain(&self, text: &str, file_path: &str, relative_path: &str, language: &str) -> Vec<TextChunk> {
        let lines = FileLines::new(text);
        let chunk_type = if language::is_prose(language) {
            ChunkType::Comment
        } else {
            ChunkType::Code
        };
        ParagraphSplitter::with_defaults(self.config.max_tokens)
            .split_lines(&lines.text)
            .into_iter()
            .filter(|(start, end)| start <= end)
            .enumerate()
            .map(|(sequence, (start, end))| {
                let plan = Planned {
                    start,
                    end,
                    chunk_type,
                    function_name: None,
                    class_name: None,
                    carries_context: false,
                };
                self.materialize(&lines, plan, sequence, file_path, relative_path, language, Vec::new(), Vec::new())
            })
            .collect()
    }

    fn plan_declaration(&self, lines: &FileLines<'_>, symbol: &Symbol, planned: &mut Vec<Planned>) {
        let (chunk_type, function_name, class_name) = if symbol.kind.is_container() {
            (ChunkType::Class, None, Some(symbol.name.clone()))
        } else {
            (ChunkType::Function, Some(symbol.name.clone()), symbol.container.clone())
        };

        let (start, end) = (symbol.span.start_line, symbol.span.end_line);
        for (piece_start, piece_end) in self.bounded(lines, start, end) {
            planned.push(Planned {
                start: piece_start,
                end: piece_end,
                chunk_type,
                function_name: function_name.clone(),
                class_name: class_name.clone(),
                carries_context: true,
            });
        }
    }

    /// Plan chunks for the lines `start..=end` that no declaration covers.
    fn plan_residual(
        &self,
        lines: &FileLines<'_>,
        classes: &[LineClass],
        start: usize,
        end: usize,
        planned: &mut Vec<Planned>,
        imports: &mut Vec<String>,
    ) {
        let mut group: Option<(LineClass, usize, usize)> = None;
        let flush = |group: Option<(LineClass, usize, usize)>, planned: &mut Vec<Planned>| {
            let Some((class, group_start, group_end)) = group else {
                return;
            };
            let chunk_type = match class {
                LineClass::Import => ChunkType::Import,
                LineClass::Comment => ChunkType::Comment,
                _ => ChunkType::Code,
            };
            for (piece_start, piece_end) in self.bounded(lines, group_start, group_end) {
                planned.push(Planned {
                    start: piece_start,
                    end: piece_end,
                    chunk_type,
                    function_name: None,
                    class_name: None,
                    carries_context: false,
                });
            }
        };

        for line in start..=end.min(classes.len()) {
            if line == 0 {
                continue;
            }
            let class = classes[line - 1];
            if class == LineClass::Import {
                imports.push(lines.text[line - 1].trim().to_string());
            }
            if class == LineClass::Blank {
                continue;
            }
            match group.as_mut() {
                Some((current, _, group_end)) if *current == class => *group_end = line,
                _ => {
                    flush(group.take(), planned);
                    group = Some((class, line, line));
                }
            }
        }
        flush(group, planned);
    }

    /// Split `start..=end` into pieces within the token bound.
    fn bounded(&self, lines: &FileLines<'_>, start: usize, end: usize) -> Vec<(usize, usize)> {
        if start > end {
            return Vec::new();
        }
        if estimate_tokens(&lines.join(start, end)) <= self.config.max_tokens {
            return vec![(start, end)];
        }
        pack_lines(&lines.text, start, end, self.config.max_tokens, ends_statement)
    }

    #[allow(clippy::too_many_arguments)]
    fn materialize(
        &self,
        lines: &FileLines<'_>,
        plan: Planned,
        sequence: usize,
        file_path: &str,
        relative_path: &str,
        language: &str,
        imports: Vec<String>,
        references: Vec<String>,
    ) -> TextChunk {
        let k = self.config.context_lines;
        let before_start = plan.start.saturating_sub(k).max(1);
        let after_end = (plan.end + k).min(lines.len());
        let context_before = lines.text[before_start - 1..plan.start - 1]
            .iter()
            .map(|l| l.to_string())
            .collect();
        let context_after = lines.text[plan.end..after_end]
            .iter()
            .map(|l| l.to_string())
            .collect();

        let content = lines.join(plan.start, plan.end);
        let (start_byte, end_byte) = lines.byte_range(plan.start, plan.end);
        TextChunk {
            repo: self.config.repo.clone(),
            file_path: file_path.to_string(),
            relative_path: relative_path.to_string(),
            sequence,
            start_line: plan.start,
            end_line: plan.end,
            start_byte,
            end_byte,
            chunk_type: plan.chunk_type,
            language: language.to_string(),
            function_name: plan.function_name,
            class_name: plan.class_name,
            imports,
            context_before,
            context_after,
            references,
            byte_size: content.len(),
            token_estimate: estimate_tokens(&content),
            content,
        }
    }
}

/// Outermost declarations in source order. Nested and overlapping
/// declarations fold into the one that starts first.
fn top_level_declarations(symbols: &[Symbol], line_count: usize) -> Vec<Symbol> {
    let mut candidates: Vec<&Symbol> = symbols
        .iter()
        .filter(|s| s.kind != SymbolKind::Variable)
        .filter(|s| s.span.start_line >= 1 && s.span.start_line <= s.span.end_line)
        .collect();
    candidates.sort_by_key(|s| (s.span.start_line, std::cmp::Reverse(s.span.end_line)));

    let mut kept: Vec<Symbol> = Vec::new();
    for symbol in candidates {
        if kept.last().is_some_and(|last| symbol.span.start_line <= last.span.end_line) {
            continue;
        }
        let mut symbol = symbol.clone();
        symbol.span.end_line = symbol.span.end_line.min(line_count);
        kept.push(symbol);
    }
    kept
}

fn references_within(relationships: &[Relationship], start: usize, end: usize) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for relationship in relationships {
        if relationship.source != MODULE_SCOPE
            && (start..=end).contains(&relationship.line)
            && !targets.contains(&relationship.target)
        {
            targets.push(relationship.target.clone());
        }
    }
    targets
}

/// Analyze and chunk one file.
///
/// The language comes from `language_hint` when given, otherwise from
/// [`detect_language`]. Languages without a registered analyzer go through
/// the paragraph splitter.
///
/// # Errors
///
/// Returns the analyzer's [`AnalysisError`](crate::AnalysisError) when the
/// file cannot be tokenized at all.
///
/// # Example
///
/// ```
/// use semdex_context::analyzer::AnalyzerRegistry;
/// use semdex_context::chunker::{Chunker, ChunkerConfig, chunk_source};
/// use semdex_context::text::ChunkType;
///
/// let registry = AnalyzerRegistry::with_defaults();
/// let chunker = Chunker::new(ChunkerConfig::new("demo"));
/// let source = r#"function hello(name) { return "Hello, " + name; }"#;
///
/// let file = chunk_source(&registry, &chunker, "/repo/hello.js", "hello.js", source, Some("general-code")).unwrap();
/// assert_eq!(file.symbols.len(), 1);
/// assert_eq!(file.symbols[0].parameters, Some(vec!["name".to_string()]));
/// assert_eq!(file.chunks.len(), 1);
/// assert_eq!(file.chunks[0].chunk_type, ChunkType::Function);
/// assert_eq!((file.chunks[0].start_line, file.chunks[0].end_line), (1, 1));
/// ```
pub fn chunk_source(
    registry: &AnalyzerRegistry,
    chunker: &Chunker,
    file_path: &str,
    relative_path: &str,
    text: &str,
    language_hint: Option<&str>,
) -> Result<ChunkedFile> {
    let language = language_hint
        .map(str::to_string)
        .unwrap_or_else(|| detect_language(Path::new(relative_path), text));

    let Some(analyzer) = registry.get(&language) else {
        tracing::debug!(file = relative_path, language = %language, "no analyzer, splitting paragraphs");
        return Ok(ChunkedFile {
            chunks: chunker.chunk_plain(text, file_path, relative_path, &language),
            language,
            symbols: Vec::new(),
            relationships: Vec::new(),
        });
    };

    let analysis = analyze(analyzer.as_ref(), text, relative_path)?;
    let chunks = chunker.chunk_analysis(&analysis, text, file_path, relative_path, &language);
    Ok(ChunkedFile {
        language,
        chunks,
        symbols: analysis.symbols,
        relationships: analysis.relationships,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, path: &str, config: ChunkerConfig) -> ChunkedFile {
        let registry = AnalyzerRegistry::with_defaults();
        chunk_source(&registry, &Chunker::new(config), path, path, source, None).unwrap()
    }

    fn assert_well_formed(chunks: &[TextChunk]) {
        for chunk in chunks {
            assert!(chunk.start_line <= chunk.end_line, "{chunk:?}");
        }
        for pair in chunks.windows(2) {
            assert!(pair[0].end_line < pair[1].start_line, "overlap: {pair:?}");
            assert_eq!(pair[0].sequence + 1, pair[1].sequence);
        }
    }

    const SERVICE_JS: &str = r#"import { db } from "./db";
import log from "./log";

// Service entry points

class Service {
  constructor(name) {
    this.name = name;
  }

  load(id) {
    return db.find(id);
  }
}

function main() {
  const s = new Service("x");
  s.load(1);
}

main();
"#;

    #[test]
    fn test_declarations_and_residuals() {
        let file = chunk(SERVICE_JS, "src/service.js", ChunkerConfig::new("demo"));
        assert_eq!(file.language, "javascript");
        assert_well_formed(&file.chunks);

        let summary: Vec<_> = file
            .chunks
            .iter()
            .map(|c| (c.chunk_type, c.start_line, c.end_line))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ChunkType::Import, 1, 2),
                (ChunkType::Comment, 4, 4),
                (ChunkType::Class, 6, 14),
                (ChunkType::Function, 16, 19),
                (ChunkType::Code, 21, 21),
            ]
        );

        let class = &file.chunks[2];
        assert_eq!(class.class_name.as_deref(), Some("Service"));
        assert_eq!(class.imports.len(), 2);
        assert!(class.references.contains(&"find".to_string()));

        let main = &file.chunks[3];
        assert_eq!(main.function_name.as_deref(), Some("main"));
        assert!(main.references.contains(&"Service".to_string()));
        assert!(main.references.contains(&"load".to_string()));
        assert_eq!(main.context_before, vec!["  }", "}", ""]);
        assert_eq!(main.context_after, vec!["", "main();"]);
    }

    #[test]
    fn test_oversized_declaration_splits_on_statements() {
        let body: String = (0..40).map(|i| format!("  total += step({i});\n")).collect();
        let source = format!("function sum() {{\n  let total = 0;\n{body}  return total;\n}}\n");
        let file = chunk(&source, "sum.js", ChunkerConfig::new("demo").with_max_tokens(40));

        assert!(file.chunks.len() > 1);
        assert_well_formed(&file.chunks);
        for piece in &file.chunks {
            assert_eq!(piece.chunk_type, ChunkType::Function);
            assert_eq!(piece.function_name.as_deref(), Some("sum"));
            assert!(piece.token_estimate <= 40, "{piece:?}");
        }
        assert_eq!(file.chunks.first().map(|c| c.start_line), Some(1));
        assert_eq!(file.chunks.last().map(|c| c.end_line), Some(44));
    }

    #[test]
    fn test_markdown_uses_paragraph_splitter() {
        let doc = "# Guide\n\nInstall it.\n\n## Usage\n\nRun it.\n";
        let file = chunk(doc, "README.md", ChunkerConfig::new("demo"));
        assert_eq!(file.language, "markdown");
        assert_eq!(file.chunks.len(), 1);
        assert_eq!(file.chunks[0].chunk_type, ChunkType::Comment);
        assert_eq!((file.chunks[0].start_line, file.chunks[0].end_line), (1, 7));
        assert!(file.symbols.is_empty());
    }

    #[test]
    fn test_flow_expressions_become_chunks() {
        let doc = r#"<?xml version="1.0"?>
<process id="p">
  <startEvent id="start"/>
  <scriptTask id="t1" name="Compute" scriptFormat="javascript">
    <script>total = a + b</script>
  </scriptTask>
  <sequenceFlow id="f1" sourceRef="start" targetRef="t1"/>
</process>
"#;
        let file = chunk(doc, "order.bpmn", ChunkerConfig::new("demo"));
        assert_well_formed(&file.chunks);
        let function = file
            .chunks
            .iter()
            .find(|c| c.chunk_type == ChunkType::Function)
            .unwrap();
        assert_eq!(function.function_name.as_deref(), Some("Compute"));
        assert!(function.content.contains("total = a + b"));
    }

    #[test]
    fn test_empty_and_malformed_inputs() {
        let registry = AnalyzerRegistry::with_defaults();
        let chunker = Chunker::default();

        let empty = chunk_source(&registry, &chunker, "a.js", "a.js", "", None).unwrap();
        assert!(empty.chunks.is_empty());

        let broken = chunk_source(&registry, &chunker, "a.bpmn", "a.bpmn", "<process><task>", None);
        assert!(broken.is_err());
    }
}
