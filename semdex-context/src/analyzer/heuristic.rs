//! Regex heuristic analyzer for languages without a grammar.
//!
//! Runs ordered passes over a copy of the text in which string literals and
//! comments are blanked out:
//!
//! 1. class-like declarations (`class`, `interface`, `enum`, `struct`, `trait`,
//!    `record`, Go `type X struct`)
//! 2. keyword functions (`func`, `fn`, `def`, `function`, `sub`, `proc`)
//! 3. method-like declarations (`returnType name(params) {`)
//!
//! Matches are accepted greedily from the top. A callable nested in another
//! callable is dropped, so nested constructs are under-extracted. Parsing
//! never fails: text that matches nothing yields an empty unit.

use super::LanguageAnalyzer;
use crate::error::Result;
use crate::unit::{
    LineIndex, MODULE_SCOPE, RelationKind, Relationship, SourceNode, SourceUnit, Span, Symbol,
    SymbolKind,
};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:(?:public|private|protected|internal|static|abstract|final|sealed|partial|export|global|virtual|open|data|with\s+sharing|without\s+sharing|inherited\s+sharing)\s+)*(class|interface|enum|struct|trait|record|object)\s+([A-Za-z_]\w*)[^;{()]*\{",
    )
    .expect("class pattern is valid")
});

static GO_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*type\s+([A-Za-z_]\w*)\s+(struct|interface)\s*\{")
        .expect("go type pattern is valid")
});

static KEYWORD_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:(?:public|private|protected|static|export|async|pub|override)\s+)*(?:func|fn|def|function|sub|proc)\s+(?:\(\s*[\w$]+\s+\*?([\w$]+)\s*\)\s*)?([A-Za-z_$][\w$]*)\s*\(([^()]*)\)[^{;]*\{",
    )
    .expect("keyword function pattern is valid")
});

static METHOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:(?:public|private|protected|internal|static|final|abstract|virtual|override|async|synchronized|inline|global|webservice|testmethod|@\w+)\s+)*([A-Za-z_][\w<>\[\],.?*&: ]*?)\s+[*&]*([A-Za-z_$][\w$]*)\s*\(([^()]*)\)\s*(?:const\s*)?(?:throws\s+[\w., ]+)?\{",
    )
    .expect("method pattern is valid")
});

static CALL_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCALL\s+([A-Za-z_][\w.]*)\s*\(").expect("call statement pattern is valid")
});

static SET_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bSET\s+[\w.@$]+\s*=\s*([A-Za-z_][\w.]*)\s*\(")
        .expect("set statement pattern is valid")
});

static NEW_EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bnew\s+([A-Za-z_][\w.]*)\s*[(<\[{]").expect("new pattern is valid")
});

static PLAIN_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z_$][\w$]*)\s*\(").expect("call pattern is valid"));

/// Words that end a return type match but mean the line is not a declaration.
const NOT_RETURN_TYPES: &[&str] = &[
    "else", "return", "new", "throw", "case", "await", "yield", "func", "fn", "def", "function",
    "sub", "proc", "do", "goto",
];

const NOT_CALLEES: &[&str] = &[
    "if", "for", "foreach", "while", "switch", "catch", "return", "sizeof", "typeof", "synchronized",
    "using", "lock", "when", "elif", "function", "func", "fn", "def", "new", "else", "do", "try",
];

/// Words after which an identifier followed by `(` is still a call.
const CALL_PRECEDERS: &[&str] = &[
    "return", "await", "yield", "throw", "else", "in", "case", "and", "or", "not", "echo",
];

const FACTORY_PREFIXES: &[&str] = &["create", "new", "from", "build", "make"];
const FACTORY_NAMES: &[&str] = &["of", "getInstance", "valueOf", "instance"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeclKind {
    Class,
    Callable,
}

#[derive(Debug, Clone)]
struct Candidate {
    pass: u8,
    kind: DeclKind,
    name: String,
    start: usize,
    open: usize,
    end: usize,
    /// Class keyword, or the return type of a callable
    keyword: String,
    parameters: Vec<String>,
    receiver: Option<String>,
    is_static: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

/// Copy of `text` with comment bodies and string contents replaced by spaces.
/// Byte offsets and line breaks are preserved.
fn mask_literals(text: &str) -> String {
    fn blank(out: &mut [u8], from: usize, to: usize) {
        for b in &mut out[from..to] {
            if *b != b'\n' {
                *b = b' ';
            }
        }
    }

    let bytes = text.as_bytes();
    let mut out = bytes.to_vec();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                let end = text[i..].find('\n').map_or(bytes.len(), |p| i + p);
                blank(&mut out, i, end);
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = text[i + 2..].find("*/").map_or(bytes.len(), |p| i + 2 + p + 2);
                blank(&mut out, i, end);
                i = end;
            }
            quote @ (b'"' | b'\'' | b'`') => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] != quote && (quote == b'`' || bytes[j] != b'\n') {
                    if bytes[j] == b'\\' {
                        j += 1;
                    }
                    j += 1;
                }
                let j = j.min(bytes.len());
                blank(&mut out, i + 1, j);
                i = (j + 1).min(bytes.len());
            }
            _ => i += 1,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Index just past the brace closing the block opened at `open`.
fn block_end(masked: &[u8], open: usize) -> usize {
    let mut depth = 0usize;
    for (i, &b) in masked.iter().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
    }
    masked.len()
}

fn parameter_names(raw: &str, name_first: bool) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let part = part.split('=').next()?.trim();
            let words: Vec<&str> = if let Some((name, _)) = part.split_once(':') {
                name.split_whitespace().collect()
            } else {
                part.split_whitespace().collect()
            };
            let word = if name_first && !part.contains(':') {
                words.first()?
            } else {
                words.last()?
            };
            let name = word.trim_matches(|c: char| matches!(c, '*' | '&' | '[' | ']' | '.' | '?'));
            (!name.is_empty() && name != "void").then(|| name.to_string())
        })
        .collect()
}

fn is_factory(name: &str) -> bool {
    FACTORY_NAMES.contains(&name)
        || FACTORY_PREFIXES.iter().any(|prefix| {
            name.strip_prefix(prefix).is_some_and(|rest| {
                rest.chars()
                    .next()
                    .is_none_or(|c| c.is_ascii_uppercase())
            })
        })
}

/// Identifier directly before `offset`, ignoring whitespace.
fn preceding_word(text: &str, offset: usize) -> &str {
    let before = text[..offset].trim_end();
    let start = before
        .rfind(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .map_or(0, |p| p + 1);
    &before[start..]
}

fn relation_node(
    lines: &LineIndex,
    source: &str,
    target: &str,
    kind: RelationKind,
    offset: usize,
) -> SourceNode {
    let label = match kind {
        RelationKind::Call => "call",
        RelationKind::Reference => "reference",
    };
    let line = lines.line_of(offset);
    SourceNode::new(label, Span::new(line, line, offset, offset))
        .with_name(target)
        .with_attribute("source", source)
}

/// Relationship nodes for the code between `from` and `to`.
fn scan_relations(
    masked: &str,
    lines: &LineIndex,
    source: &str,
    from: usize,
    to: usize,
    statements_only: bool,
) -> Vec<SourceNode> {
    let body = &masked[from..to];
    let mut seen: HashSet<(String, usize)> = HashSet::new();
    let mut found: Vec<(usize, SourceNode)> = Vec::new();
    let mut push = |target: &str, kind: RelationKind, offset: usize| {
        let line = lines.line_of(from + offset);
        if seen.insert((target.to_string(), line)) {
            found.push((
                offset,
                relation_node(lines, source, target, kind, from + offset),
            ));
        }
    };

    for pattern in [&*CALL_STATEMENT, &*SET_STATEMENT] {
        for captures in pattern.captures_iter(body) {
            if let Some(target) = captures.get(1) {
                push(target.as_str(), RelationKind::Call, target.start());
            }
        }
    }

    if !statements_only {
        for captures in NEW_EXPRESSION.captures_iter(body) {
            if let Some(target) = captures.get(1) {
                push(target.as_str(), RelationKind::Reference, target.start());
            }
        }
        for captures in PLAIN_CALL.captures_iter(body) {
            let Some(target) = captures.get(1) else {
                continue;
            };
            let name = target.as_str();
            if NOT_CALLEES.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            if target.start() > 0
                && body[..target.start()]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$')
            {
                continue;
            }
            let previous = preceding_word(body, target.start());
            if !previous.is_empty() && !CALL_PRECEDERS.contains(&previous.to_ascii_lowercase().as_str())
            {
                continue;
            }
            push(name, RelationKind::Call, target.start());
        }
    }

    found.sort_by_key(|(offset, _)| *offset);
    found.into_iter().map(|(_, node)| node).collect()
}

fn collect_candidates(masked: &str, name_first: bool) -> Vec<Candidate> {
    let bytes = masked.as_bytes();
    let mut candidates = Vec::new();

    let leading = |start: usize, end: usize| {
        let slice = &masked[start..end];
        start + (slice.len() - slice.trim_start().len())
    };

    for captures in CLASS.captures_iter(masked) {
        let (Some(whole), Some(keyword), Some(name)) =
            (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };
        let open = whole.end() - 1;
        candidates.push(Candidate {
            pass: 0,
            kind: DeclKind::Class,
            name: name.as_str().to_string(),
            start: leading(whole.start(), whole.end()),
            open,
            end: block_end(bytes, open),
            keyword: keyword.as_str().to_string(),
            parameters: Vec::new(),
            receiver: None,
            is_static: false,
        });
    }

    for captures in GO_TYPE.captures_iter(masked) {
        let (Some(whole), Some(name), Some(keyword)) =
            (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };
        let open = whole.end() - 1;
        candidates.push(Candidate {
            pass: 0,
            kind: DeclKind::Class,
            name: name.as_str().to_string(),
            start: leading(whole.start(), whole.end()),
            open,
            end: block_end(bytes, open),
            keyword: keyword.as_str().to_string(),
            parameters: Vec::new(),
            receiver: None,
            is_static: false,
        });
    }

    for captures in KEYWORD_FUNCTION.captures_iter(masked) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(2)) else {
            continue;
        };
        let open = whole.end() - 1;
        let raw_parameters = captures.get(3).map_or("", |m| m.as_str());
        candidates.push(Candidate {
            pass: 1,
            kind: DeclKind::Callable,
            name: name.as_str().to_string(),
            start: leading(whole.start(), whole.end()),
            open,
            end: block_end(bytes, open),
            keyword: String::new(),
            parameters: parameter_names(raw_parameters, name_first),
            receiver: captures.get(1).map(|m| m.as_str().to_string()),
            is_static: whole.as_str().contains("static"),
        });
    }

    for captures in METHOD.captures_iter(masked) {
        let (Some(whole), Some(return_type), Some(name)) =
            (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };
        let return_type = return_type.as_str().trim();
        let last_word = return_type.split_whitespace().last().unwrap_or(return_type);
        if NOT_RETURN_TYPES.contains(&last_word)
            || NOT_CALLEES.contains(&name.as_str())
            || NOT_CALLEES.contains(&last_word)
        {
            continue;
        }
        let open = whole.end() - 1;
        let raw_parameters = captures.get(3).map_or("", |m| m.as_str());
        candidates.push(Candidate {
            pass: 2,
            kind: DeclKind::Callable,
            name: name.as_str().to_string(),
            start: leading(whole.start(), whole.end()),
            open,
            end: block_end(bytes, open),
            keyword: last_word.to_string(),
            parameters: parameter_names(raw_parameters, name_first),
            receiver: None,
            is_static: whole.as_str().contains("static"),
        });
    }

    candidates.sort_by_key(|c| (c.start, c.pass));
    candidates.dedup_by_key(|c| c.start);
    candidates
}

struct Accepted {
    candidate: Candidate,
    parent: Option<usize>,
    kind: SymbolKind,
    container: Option<String>,
    relations: Vec<SourceNode>,
}

fn declaration_label(kind: SymbolKind) -> &'static str {
    match kind {
        SymbolKind::Class => "class_declaration",
        SymbolKind::Method => "method_declaration",
        SymbolKind::Constructor => "constructor_declaration",
        _ => "function_declaration",
    }
}

fn build_node(index: usize, accepted: &[Accepted], lines: &LineIndex) -> SourceNode {
    let item = &accepted[index];
    let candidate = &item.candidate;
    let mut node = SourceNode::new(
        declaration_label(item.kind),
        lines.span(candidate.start, candidate.end),
    )
    .with_name(candidate.name.clone())
    .with_attribute("keyword", candidate.keyword.clone());
    if candidate.kind == DeclKind::Callable {
        node = node.with_attribute("parameters", candidate.parameters.join(","));
    }
    if let Some(container) = &item.container {
        node = node.with_attribute("container", container.clone());
    }

    let mut children: Vec<SourceNode> = accepted
        .iter()
        .enumerate()
        .filter(|(_, a)| a.parent == Some(index))
        .map(|(child, _)| build_node(child, accepted, lines))
        .collect();
    children.extend(item.relations.iter().cloned());
    children.sort_by_key(|child| child.span.start_byte);
    node.children = children;
    node
}

impl LanguageAnalyzer for HeuristicAnalyzer {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn parse(&self, text: &str, filename: &str) -> Result<SourceUnit> {
        let masked = mask_literals(text);
        let lines = LineIndex::new(text);
        let name_first = filename.ends_with(".go");

        let candidates = collect_candidates(&masked, name_first);
        let class_names: HashSet<String> = candidates
            .iter()
            .filter(|c| c.kind == DeclKind::Class)
            .map(|c| c.name.clone())
            .collect();

        let mut accepted: Vec<Accepted> = Vec::new();
        let mut open: Vec<usize> = Vec::new();
        for candidate in candidates {
            while open
                .last()
                .is_some_and(|&top| accepted[top].candidate.end <= candidate.start)
            {
                open.pop();
            }
            let parent = open.last().copied();
            if parent.is_some_and(|p| accepted[p].candidate.kind == DeclKind::Callable) {
                continue;
            }
            let enclosing_class = parent.map(|p| accepted[p].candidate.name.clone());

            let (kind, container) = match candidate.kind {
                DeclKind::Class => (SymbolKind::Class, enclosing_class),
                DeclKind::Callable => {
                    let container = enclosing_class.or_else(|| candidate.receiver.clone());
                    let constructs_class = class_names.contains(&candidate.name)
                        || (is_factory(&candidate.name)
                            && (candidate.is_static || class_names.contains(&candidate.keyword)));
                    let kind = if constructs_class {
                        SymbolKind::Constructor
                    } else if container.is_some() {
                        SymbolKind::Method
                    } else {
                        SymbolKind::Function
                    };
                    (kind, container)
                }
            };

            let relations = if candidate.kind == DeclKind::Callable {
                let body_start = (candidate.open + 1).min(candidate.end);
                scan_relations(&masked, &lines, &candidate.name, body_start, candidate.end, false)
            } else {
                Vec::new()
            };

            open.push(accepted.len());
            accepted.push(Accepted {
                candidate,
                parent,
                kind,
                container,
                relations,
            });
        }

        let mut root = SourceNode::new("source", lines.span(0, text.len()));
        let mut children: Vec<SourceNode> = accepted
            .iter()
            .enumerate()
            .filter(|(_, a)| a.parent.is_none())
            .map(|(index, _)| build_node(index, &accepted, &lines))
            .collect();

        // CALL/SET statements outside any callable belong to the module scope.
        let callables: Vec<(usize, usize)> = accepted
            .iter()
            .filter(|a| a.candidate.kind == DeclKind::Callable)
            .map(|a| (a.candidate.start, a.candidate.end))
            .collect();
        children.extend(
            scan_relations(&masked, &lines, MODULE_SCOPE, 0, masked.len(), true)
                .into_iter()
                .filter(|node| {
                    !callables
                        .iter()
                        .any(|&(start, end)| start <= node.span.start_byte && node.span.start_byte < end)
                }),
        );
        children.sort_by_key(|child| child.span.start_byte);
        root.children = children;

        Ok(SourceUnit {
            language: "heuristic".to_string(),
            path: filename.to_string(),
            line_count: lines.line_count(),
            root,
        })
    }

    fn extract_functions(&self, unit: &SourceUnit) -> Vec<Symbol> {
        unit.nodes()
            .filter_map(|visited| {
                let node = visited.node;
                let kind = match node.kind.as_str() {
                    "class_declaration" => SymbolKind::Class,
                    "function_declaration" => SymbolKind::Function,
                    "method_declaration" => SymbolKind::Method,
                    "constructor_declaration" => SymbolKind::Constructor,
                    _ => return None,
                };
                let mut symbol = Symbol::new(node.name.clone()?, kind, unit.path.clone(), node.span)
                    .with_container(node.attribute("container").map(str::to_string));
                if let Some(parameters) = node.attribute("parameters") {
                    symbol = symbol.with_parameters(
                        parameters
                            .split(',')
                            .filter(|p| !p.is_empty())
                            .map(str::to_string)
                            .collect(),
                    );
                }
                Some(symbol)
            })
            .collect()
    }

    fn extract_relationships(&self, unit: &SourceUnit) -> Vec<Relationship> {
        unit.nodes()
            .filter_map(|visited| {
                let node = visited.node;
                let kind = match node.kind.as_str() {
                    "call" => RelationKind::Call,
                    "reference" => RelationKind::Reference,
                    _ => return None,
                };
                Some(Relationship {
                    source: node.attribute("source")?.to_string(),
                    target: node.name.clone()?,
                    kind,
                    line: node.span.start_line,
                })
            })
            .collect()
    }
}
