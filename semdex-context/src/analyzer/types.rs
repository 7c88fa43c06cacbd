//! Declarative type analyzer.
//!
//! Recognizes `type Name = ...`, `interface Name { ... }` and C `typedef`s.
//! Definitions are delimited by a bracket-aware scanner, so nested generic
//! syntax such as `type Index = Map<string, Array<Entry>>` is kept whole.

use super::LanguageAnalyzer;
use crate::error::Result;
use crate::language::DECLARATIVE_TYPES;
use crate::unit::{
    LineIndex, RelationKind, Relationship, SourceNode, SourceUnit, Symbol, SymbolKind, TypeKind,
};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::LazyLock;

static TYPE_ALIAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:export\s+)?(?:declare\s+)?type\s+([A-Za-z_$][\w$]*)\s*(?:<[^=;]*>)?\s*=")
        .expect("type alias pattern is valid")
});

static INTERFACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:export\s+)?(?:declare\s+)?interface\s+([A-Za-z_$][\w$]*)[^{;]*\{")
        .expect("interface pattern is valid")
});

static TYPEDEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*typedef\s+([^;{}]+?)\s+\**([A-Za-z_]\w*)\s*;")
        .expect("typedef pattern is valid")
});

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_$][\w$]*").expect("identifier pattern is valid"));

const PRIMITIVES: &[&str] = &[
    "string", "number", "boolean", "bigint", "symbol", "null", "undefined", "void", "never",
    "any", "unknown", "object", "int", "float", "double", "bool", "char", "long", "short",
    "unsigned", "unsigned int", "unsigned long", "size_t",
];

/// One definition from the flat list this analyzer produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeDefinition {
    pub name: String,
    pub definition: String,
    pub kind: TypeKind,
}

#[derive(Debug, Clone, Default)]
pub struct TypeDeclAnalyzer;

impl TypeDeclAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// The `{name, raw definition, kind}` list for a parsed unit.
    pub fn type_definitions(&self, unit: &SourceUnit) -> Vec<TypeDefinition> {
        unit.root
            .children
            .iter()
            .filter_map(|node| {
                Some(TypeDefinition {
                    name: node.name.clone()?,
                    definition: node.text.clone()?,
                    kind: kind_from_label(node.attribute("kind")?)?,
                })
            })
            .collect()
    }
}

pub fn classify(definition: &str) -> TypeKind {
    let d = definition.trim();
    if d.starts_with('{') || d.starts_with("struct") || d.starts_with("union") {
        TypeKind::Record
    } else if d.ends_with("[]")
        || d.starts_with('[')
        || ["Array<", "ReadonlyArray<", "Vec<", "List<", "Set<"]
            .iter()
            .any(|prefix| d.starts_with(prefix))
    {
        TypeKind::Array
    } else if PRIMITIVES.contains(&d) {
        TypeKind::Primitive
    } else {
        TypeKind::Alias
    }
}

fn kind_label(kind: TypeKind) -> &'static str {
    match kind {
        TypeKind::Alias => "alias",
        TypeKind::Record => "record",
        TypeKind::Array => "array",
        TypeKind::Primitive => "primitive",
    }
}

fn kind_from_label(label: &str) -> Option<TypeKind> {
    match label {
        "alias" => Some(TypeKind::Alias),
        "record" => Some(TypeKind::Record),
        "array" => Some(TypeKind::Array),
        "primitive" => Some(TypeKind::Primitive),
        _ => None,
    }
}

/// End (exclusive) of a definition starting at `start`.
///
/// Stops at `;` or at a line break outside any bracket, unless the line
/// visibly continues (trailing `=`/`|`/`&`/`,` or a leading `|`/`&` on the
/// next line).
fn scan_definition(text: &str, start: usize) -> usize {
    let bytes = text.as_bytes();
    let mut depth: i32 = 0;
    let mut quote: Option<u8> = None;
    let mut i = start;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' | b'\'' | b'`' => quote = Some(b),
            b'>' if i > start && bytes[i - 1] == b'=' => {}
            b'<' | b'(' | b'[' | b'{' => depth += 1,
            b'>' | b')' | b']' | b'}' => {
                depth -= 1;
                if depth < 0 {
                    return i;
                }
            }
            b';' if depth == 0 => return i,
            b'\n' if depth == 0 => {
                let so_far = text[start..i].trim_end();
                let continues_before = so_far.is_empty()
                    || so_far.ends_with(['=', '|', '&', ',', ':', '?'])
                    || so_far.ends_with("=>");
                let rest = text[i + 1..].trim_start();
                let continues_after = rest.starts_with(['|', '&', '?', '.']);
                if !continues_before && !continues_after {
                    return i;
                }
            }
            _ => {}
        }
        i += 1;
    }
    bytes.len()
}

struct Found {
    start: usize,
    end: usize,
    name: String,
    definition: String,
    kind: TypeKind,
    form: &'static str,
}

impl LanguageAnalyzer for TypeDeclAnalyzer {
    fn name(&self) -> &'static str {
        "types"
    }

    fn parse(&self, text: &str, filename: &str) -> Result<SourceUnit> {
        let lines = LineIndex::new(text);
        let mut found = Vec::new();

        for captures in TYPE_ALIAS.captures_iter(text) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let end = scan_definition(text, whole.end());
            let definition = text[whole.end()..end].trim().to_string();
            found.push(Found {
                start: whole.start(),
                end,
                name: name.as_str().to_string(),
                kind: classify(&definition),
                definition,
                form: "type",
            });
        }

        for captures in INTERFACE.captures_iter(text) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let open = whole.end() - 1;
            let end = scan_definition(text, open);
            let close = (end + 1).min(text.len());
            let body_end = if text[..close].ends_with('}') { close } else { end };
            found.push(Found {
                start: whole.start(),
                end: body_end,
                name: name.as_str().to_string(),
                definition: text[open..body_end].trim().to_string(),
                kind: TypeKind::Record,
                form: "interface",
            });
        }

        for captures in TYPEDEF.captures_iter(text) {
            let (Some(whole), Some(definition), Some(name)) =
                (captures.get(0), captures.get(1), captures.get(2))
            else {
                continue;
            };
            let definition = definition.as_str().trim().to_string();
            found.push(Found {
                start: whole.start(),
                end: whole.end(),
                name: name.as_str().to_string(),
                kind: classify(&definition),
                definition,
                form: "typedef",
            });
        }

        found.sort_by_key(|f| f.start);
        let names: HashSet<String> = found.iter().map(|f| f.name.clone()).collect();

        let mut root = SourceNode::new("declarations", lines.span(0, text.len()));
        for item in found {
            let leading = text[item.start..item.end].len()
                - text[item.start..item.end].trim_start().len();
            let mut node = SourceNode::new("type_definition", lines.span(item.start + leading, item.end))
                .with_name(item.name.clone())
                .with_text(item.definition.clone())
                .with_attribute("kind", kind_label(item.kind))
                .with_attribute("form", item.form);

            let mut seen = HashSet::new();
            for reference in IDENTIFIER.find_iter(&item.definition) {
                let target = reference.as_str();
                if target != item.name && names.contains(target) && seen.insert(target.to_string()) {
                    node.children.push(
                        SourceNode::new("type_reference", node.span).with_name(target),
                    );
                }
            }
            root.children.push(node);
        }

        Ok(SourceUnit {
            language: DECLARATIVE_TYPES.to_string(),
            path: filename.to_string(),
            line_count: lines.line_count(),
            root,
        })
    }

    fn extract_functions(&self, unit: &SourceUnit) -> Vec<Symbol> {
        unit.root
            .children
            .iter()
            .filter_map(|node| {
                let name = node.name.clone()?;
                let mut symbol = Symbol::new(name, SymbolKind::Type, unit.path.clone(), node.span);
                symbol.type_kind = node.attribute("kind").and_then(kind_from_label);
                symbol.definition = node.text.clone();
                Some(symbol)
            })
            .collect()
    }

    fn extract_relationships(&self, unit: &SourceUnit) -> Vec<Relationship> {
        unit.root
            .children
            .iter()
            .filter_map(|definition| Some((definition.name.as_deref()?, definition)))
            .flat_map(|(source, definition)| {
                definition.children.iter().filter_map(move |reference| {
                    Some(Relationship {
                        source: source.to_string(),
                        target: reference.name.clone()?,
                        kind: RelationKind::Reference,
                        line: reference.span.start_line,
                    })
                })
            })
            .collect()
    }
}
