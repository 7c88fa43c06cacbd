//! The chunk model and the paragraph splitter used for prose.
//!
//! A [`TextChunk`] is one retrievable slice of a file. Its [`TextChunk::build`]
//! method renders the passage that is actually embedded:
//!
//! ```text
//! passage: {"repo": "example", "path": "src/lib.rs"}
//!
//! context: {"imports": ["use std::sync::Arc;"]}
//! /// Create a wrapped database connection
//!
//! focus: {"type": "function", "name": "connect", "lines": "12-17"}
//! pub fn connect(host: &str) -> Result<DatabaseHandle> {
//!     ...
//! }
//! ```
//!
//! Files that no analyzer understands (markdown, plain text) go through the
//! [`ParagraphSplitter`], which walks line-aligned segments and packs them up
//! to a token bound.
//!
//! # Example
//!
//! ```
//! use semdex_context::text::{ParagraphSplitter, estimate_tokens};
//!
//! let splitter = ParagraphSplitter::with_defaults(64);
//! let doc = "# Title\n\nFirst paragraph.\n\n## Next\n\nSecond paragraph.\n";
//! let ranges = splitter.split(doc);
//! assert_eq!(ranges, vec![(1, 7)]);
//! assert_eq!(estimate_tokens("abcd"), 1);
//! assert_eq!(estimate_tokens("abcde"), 2);
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Line patterns that always open a new prose segment.
///
/// - `^\s*#{1,6}\s+`: Markdown headings
/// - `^\s*(-{3,}|\*{3,}|_{3,})\s*$`: horizontal rules
///
/// Code fences are handled separately: a fenced block is always one segment.
/// List items stay with their neighbours until a blank line.
pub const DEFAULT_MARKDOWN_BOUNDARIES: &[&str] =
    &[r"^\s*#{1,6}\s+", r"^\s*(-{3,}|\*{3,}|_{3,})\s*$"];

const FENCE: &str = "```";

/// Heuristic token count: four characters per token, rounded up.
/// Non-empty text is at least one token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Kind of content a chunk holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Function,
    Class,
    Import,
    Comment,
    Code,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Function => "function",
            ChunkType::Class => "class",
            ChunkType::Import => "import",
            ChunkType::Comment => "comment",
            ChunkType::Code => "code",
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "function" => Ok(ChunkType::Function),
            "class" => Ok(ChunkType::Class),
            "import" => Ok(ChunkType::Import),
            "comment" => Ok(ChunkType::Comment),
            "code" => Ok(ChunkType::Code),
            _ => Err(format!("Unknown chunk type: {s}")),
        }
    }
}

/// One retrievable slice of a file together with its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Repository name
    pub repo: String,
    /// Path as given to the chunker (usually absolute)
    pub file_path: String,
    /// Path relative to the repository root
    pub relative_path: String,
    /// Position of the chunk within its file (0-indexed)
    pub sequence: usize,
    /// First line, 1-based inclusive
    pub start_line: usize,
    /// Last line, 1-based inclusive
    pub end_line: usize,
    pub start_byte: usize,
    pub end_byte: usize,
    pub chunk_type: ChunkType,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_before: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_after: Vec<String>,
    /// Relationship targets whose source lies inside this chunk
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    pub content: String,
    pub byte_size: usize,
    pub token_estimate: usize,
}

impl TextChunk {
    /// Render the chunk as a retrieval passage.
    ///
    /// The header carries the repository and path, an optional `context:`
    /// block holds imports and the lines before the chunk, and the chunk
    /// itself follows `focus:`.
    ///
    /// # Examples
    ///
    /// ```
    /// use semdex_context::text::{ChunkType, TextChunk};
    ///
    /// let chunk = TextChunk {
    ///     repo: "my_repo".to_string(),
    ///     file_path: "/src/my_repo/src/utils.rs".to_string(),
    ///     relative_path: "src/utils.rs".to_string(),
    ///     sequence: 0,
    ///     start_line: 1,
    ///     end_line: 3,
    ///     start_byte: 0,
    ///     end_byte: 44,
    ///     chunk_type: ChunkType::Function,
    ///     language: "rust".to_string(),
    ///     function_name: Some("add".to_string()),
    ///     class_name: None,
    ///     imports: vec![],
    ///     context_before: vec![],
    ///     context_after: vec![],
    ///     references: vec![],
    ///     content: "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}".to_string(),
    ///     byte_size: 44,
    ///     token_estimate: 11,
    /// };
    ///
    /// let passage = chunk.build();
    /// assert!(passage.starts_with("passage: {\"repo\": \"my_repo\", \"path\": \"src/utils.rs\"}"));
    /// assert!(passage.contains("focus: {\"type\": \"function\", \"name\": \"add\", \"lines\": \"1-3\"}\npub fn add"));
    /// assert!(!passage.contains("context:"));
    /// ```
    pub fn build(&self) -> String {
        let mut passage = format!(
            "passage: {{\"repo\": {}, \"path\": {}}}\n\n",
            json_string(&self.repo),
            json_string(&self.relative_path)
        );

        if !self.imports.is_empty() || !self.context_before.is_empty() {
            let imports: Vec<String> = self.imports.iter().map(|i| json_string(i)).collect();
            passage.push_str(&format!("context: {{\"imports\": [{}]}}\n", imports.join(", ")));
            for line in &self.context_before {
                passage.push_str(line);
                passage.push('\n');
            }
            passage.push('\n');
        }

        let name = match (&self.class_name, &self.function_name) {
            (Some(class), Some(function)) => format!(", \"name\": {}", json_string(&format!("{class}.{function}"))),
            (None, Some(function)) => format!(", \"name\": {}", json_string(function)),
            (Some(class), None) => format!(", \"name\": {}", json_string(class)),
            (None, None) => String::new(),
        };
        passage.push_str(&format!(
            "focus: {{\"type\": \"{}\"{}, \"lines\": \"{}\"}}\n{}",
            self.chunk_type,
            name,
            self.line_range(),
            self.content
        ));
        passage
    }

    /// `start-end` as shown to users.
    pub fn line_range(&self) -> String {
        format!("{}-{}", self.start_line, self.end_line)
    }

    /// Function and class names attached to the chunk.
    pub fn names(&self) -> Vec<String> {
        self.class_name
            .iter()
            .chain(self.function_name.iter())
            .cloned()
            .collect()
    }
}

fn json_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""))
}

/// Pack lines `start..=end` (1-based) into pieces of at most `max_tokens`.
///
/// Lines are never cut. When a piece has to end early, the last line for
/// which `is_boundary` holds is preferred as its final line. A single line
/// longer than the bound becomes a piece of its own.
pub fn pack_lines(
    lines: &[&str],
    start: usize,
    end: usize,
    max_tokens: usize,
    is_boundary: impl Fn(&str) -> bool,
) -> Vec<(usize, usize)> {
    let max_chars = max_tokens.max(1) * 4;
    let end = end.min(lines.len());
    let mut pieces = Vec::new();
    let mut piece_start = start.max(1);

    while piece_start <= end {
        let mut chars = 0usize;
        let mut next = piece_start;
        while next <= end {
            let added = lines[next - 1].chars().count() + usize::from(next > piece_start);
            if chars + added > max_chars && next > piece_start {
                break;
            }
            chars += added;
            next += 1;
        }

        let mut piece_end = next - 1;
        if next <= end {
            if let Some(boundary) = (piece_start..=piece_end)
                .rev()
                .find(|&line| is_boundary(lines[line - 1]))
            {
                piece_end = boundary;
            }
        }
        pieces.push((piece_start, piece_end));
        piece_start = piece_end + 1;
    }
    pieces
}

/// Line-aligned splitter for prose and unknown languages.
#[derive(Debug, Clone)]
pub struct ParagraphSplitter {
    boundaries: Vec<Regex>,
    max_tokens: usize,
}

impl ParagraphSplitter {
    /// Creates a splitter from boundary patterns. Invalid patterns are
    /// skipped with a warning.
    pub fn new(boundary_patterns: &[&str], max_tokens: usize) -> Self {
        let boundaries = boundary_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!("Ignoring invalid boundary pattern {pattern}: {e}");
                    None
                }
            })
            .collect();
        Self {
            boundaries,
            max_tokens,
        }
    }

    pub fn with_defaults(max_tokens: usize) -> Self {
        Self::new(DEFAULT_MARKDOWN_BOUNDARIES, max_tokens)
    }

    /// Segments of non-blank lines as 1-based inclusive line ranges.
    ///
    /// A segment ends at a blank line, before a boundary line, or at the
    /// closing fence of a fenced block.
    pub fn segments(&self, lines: &[&str]) -> Vec<(usize, usize)> {
        let mut segments = Vec::new();
        let mut current: Option<(usize, usize)> = None;
        let mut in_fence = false;

        for (index, line) in lines.iter().enumerate() {
            let number = index + 1;
            let is_fence = line.trim_start().starts_with(FENCE);

            if in_fence {
                if let Some((_, end)) = current.as_mut() {
                    *end = number;
                }
                if is_fence {
                    in_fence = false;
                    segments.extend(current.take());
                }
                continue;
            }

            if line.trim().is_empty() {
                segments.extend(current.take());
                continue;
            }

            let opens = is_fence || self.boundaries.iter().any(|b| b.is_match(line));
            if opens {
                segments.extend(current.take());
            }
            in_fence = is_fence;
            match current.as_mut() {
                Some((_, end)) => *end = number,
                None => current = Some((number, number)),
            }
        }
        segments.extend(current);
        segments
    }

    /// Chunk ranges for `text`: consecutive segments packed up to the token
    /// bound. Oversized segments are split on line boundaries.
    pub fn split(&self, text: &str) -> Vec<(usize, usize)> {
        let lines: Vec<&str> = text.lines().collect();
        self.split_lines(&lines)
    }

    pub fn split_lines(&self, lines: &[&str]) -> Vec<(usize, usize)> {
        let max_chars = self.max_tokens.max(1) * 4;
        let span_chars = |start: usize, end: usize| -> usize {
            lines[start - 1..end]
                .iter()
                .map(|l| l.chars().count() + 1)
                .sum::<usize>()
                .saturating_sub(1)
        };

        let mut ranges = Vec::new();
        let mut current: Option<(usize, usize)> = None;
        for (start, end) in self.segments(lines) {
            if span_chars(start, end) > max_chars {
                ranges.extend(current.take());
                ranges.extend(pack_lines(lines, start, end, self.max_tokens, |l| {
                    l.trim().is_empty()
                }));
                continue;
            }
            current = match current {
                Some((open, _)) if span_chars(open, end) <= max_chars => Some((open, end)),
                Some(done) => {
                    ranges.push(done);
                    Some((start, end))
                }
                None => Some((start, end)),
            };
        }
        ranges.extend(current);
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKDOWN: &str = r#"# Heading 1

This is a paragraph.

## Heading 2

- List item 1
- List item 2

```rust
fn main() {

    println!("Hello, world!");
}
```

Another paragraph.
"#;

    #[test]
    fn test_segments_follow_markdown_structure() {
        let splitter = ParagraphSplitter::with_defaults(500);
        let lines: Vec<&str> = MARKDOWN.lines().collect();
        let segments = splitter.segments(&lines);

        assert_eq!(
            segments,
            vec![(1, 1), (3, 3), (5, 5), (7, 8), (10, 15), (17, 17)]
        );
    }

    #[test]
    fn test_split_packs_segments_up_to_bound() {
        let whole = ParagraphSplitter::with_defaults(500).split(MARKDOWN);
        assert_eq!(whole, vec![(1, 17)]);

        let small = ParagraphSplitter::with_defaults(8).split(MARKDOWN);
        assert!(small.len() > 1);
        for window in small.windows(2) {
            assert!(window[0].1 < window[1].0, "ranges overlap: {small:?}");
        }
        // The fenced block never shares a range with the paragraph after it.
        assert!(!small.iter().any(|&(start, end)| start <= 15 && end >= 17));
    }

    #[test]
    fn test_split_empty_text() {
        assert!(ParagraphSplitter::with_defaults(100).split("").is_empty());
        assert!(ParagraphSplitter::with_defaults(100).split("\n\n\n").is_empty());
    }

    #[test]
    fn test_pack_lines_prefers_statement_ends() {
        let lines = vec!["let a = 1;", "let b = call(", "    a,", ");", "let c = 3;"];
        // 12 chars per piece at most
        let pieces = pack_lines(&lines, 1, 5, 3, |l| l.trim_end().ends_with(';'));
        assert_eq!(pieces, vec![(1, 1), (2, 2), (3, 4), (5, 5)]);
        for (start, end) in &pieces {
            assert!(start <= end);
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abcdefghi"), 3);
    }

    #[test]
    fn test_chunk_type_parsing() {
        assert_eq!("Function".parse::<ChunkType>(), Ok(ChunkType::Function));
        assert_eq!(ChunkType::Import.to_string(), "import");
        assert!("widget".parse::<ChunkType>().is_err());
    }
}
