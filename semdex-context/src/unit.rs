//! Language-agnostic representation of one analyzed file.
//!
//! Every analyzer, whether it drives a real grammar or a handful of regular
//! expressions, produces the same shapes:
//!
//! - [`SourceUnit`]: a tree of [`SourceNode`]s rooted at a synthetic node
//! - [`Symbol`]: a declaration recovered from the tree
//! - [`Relationship`]: a directed call/reference hint between two symbols
//!
//! Units are transient. They live for one analysis call and are dropped once
//! the chunker has consumed them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Line and byte extent of a node. Lines are 1-based and inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start_line: usize,
    pub end_line: usize,
    pub start_byte: usize,
    pub end_byte: usize,
}

impl Span {
    pub fn new(start_line: usize, end_line: usize, start_byte: usize, end_byte: usize) -> Self {
        Self {
            start_line,
            end_line,
            start_byte,
            end_byte,
        }
    }

    /// Number of lines covered, never less than one.
    pub fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    pub fn contains_line(&self, line: usize) -> bool {
        self.start_line <= line && line <= self.end_line
    }
}

/// One node of an abstract source unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceNode {
    /// Type tag: a grammar node kind, an element tag, or an analyzer-defined label
    pub kind: String,
    /// Label of the edge from the parent, when the grammar names it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    pub span: Span,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SourceNode>,
}

impl SourceNode {
    pub fn new(kind: impl Into<String>, span: Span) -> Self {
        Self {
            kind: kind.into(),
            span,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// First direct child reached through the given field label.
    pub fn child_by_field(&self, field: &str) -> Option<&SourceNode> {
        self.children
            .iter()
            .find(|c| c.field.as_deref() == Some(field))
    }

    /// First descendant (pre-order, self included) whose kind matches.
    pub fn find_kind(&self, kind: &str) -> Option<&SourceNode> {
        Traversal::new(self)
            .map(|visited| visited.node)
            .find(|node| node.kind == kind)
    }
}

/// A whole file after parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceUnit {
    pub language: String,
    pub path: String,
    pub line_count: usize,
    pub root: SourceNode,
}

impl SourceUnit {
    /// Fresh pre-order walk over every node of the unit.
    pub fn nodes(&self) -> Traversal<'_> {
        Traversal::new(&self.root)
    }
}

/// One step from a parent to a child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// A node together with the path that leads to it from the root.
#[derive(Debug, Clone)]
pub struct VisitedNode<'a> {
    pub node: &'a SourceNode,
    pub path: Vec<PathSegment>,
}

impl VisitedNode<'_> {
    pub fn depth(&self) -> usize {
        self.path.len()
    }
}

/// Lazy pre-order traversal yielding `{node, path}` pairs.
///
/// Holds nothing but its own stack, so starting a new traversal over the same
/// unit always begins from the root again.
#[derive(Debug)]
pub struct Traversal<'a> {
    stack: Vec<(&'a SourceNode, Vec<PathSegment>)>,
}

impl<'a> Traversal<'a> {
    pub fn new(root: &'a SourceNode) -> Self {
        Self {
            stack: vec![(root, Vec::new())],
        }
    }
}

impl<'a> Iterator for Traversal<'a> {
    type Item = VisitedNode<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (node, path) = self.stack.pop()?;
        for (index, child) in node.children.iter().enumerate().rev() {
            let mut child_path = path.clone();
            child_path.push(match &child.field {
                Some(field) => PathSegment::Field(field.clone()),
                None => PathSegment::Index(index),
            });
            self.stack.push((child, child_path));
        }
        Some(VisitedNode { node, path })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Method,
    Constructor,
    Class,
    Module,
    Component,
    Type,
    Variable,
}

impl SymbolKind {
    /// Kinds that own callable code.
    pub fn is_callable(self) -> bool {
        matches!(self, Self::Function | Self::Method | Self::Constructor)
    }

    /// Kinds that group other declarations.
    pub fn is_container(self) -> bool {
        matches!(
            self,
            Self::Class | Self::Module | Self::Component | Self::Type
        )
    }
}

/// Classification of a declarative type definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Alias,
    Record,
    Array,
    Primitive,
}

/// A declaration recovered by an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Defining file
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<String>>,
    /// Size estimate in lines
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    pub span: Span,
    /// Enclosing class/module/impl, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Language of an embedded expression (flow pseudo-functions)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_kind: Option<TypeKind>,
    /// Raw definition or expression text, when the analyzer keeps it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, file: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            kind,
            file: file.into(),
            parameters: None,
            size: Some(span.line_count()),
            span,
            container: None,
            expression_language: None,
            type_kind: None,
            definition: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<String>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_container(mut self, container: Option<String>) -> Self {
        self.container = container;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Call,
    Reference,
}

/// Directed edge between two symbols, located at the line where it occurs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Relationship {
    pub source: String,
    pub target: String,
    pub kind: RelationKind,
    pub line: usize,
}

/// Symbol name used for code that sits outside any declaration.
pub const MODULE_SCOPE: &str = "<module>";

/// Maps byte offsets to 1-based line numbers.
#[derive(Debug, Clone)]
pub struct LineIndex {
    starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        Self {
            starts,
            len: text.len(),
        }
    }

    pub fn line_of(&self, byte: usize) -> usize {
        let byte = byte.min(self.len);
        match self.starts.binary_search(&byte) {
            Ok(line) => line + 1,
            Err(next) => next,
        }
    }

    /// Number of lines, not counting an empty trailing line after a final newline.
    pub fn line_count(&self) -> usize {
        match self.starts.last() {
            Some(&last) if last == self.len && self.starts.len() > 1 => self.starts.len() - 1,
            _ => self.starts.len(),
        }
    }

    pub fn span(&self, start_byte: usize, end_byte: usize) -> Span {
        let end_line = self.line_of(end_byte.saturating_sub(1).max(start_byte));
        Span::new(self.line_of(start_byte), end_line, start_byte, end_byte)
    }
}
