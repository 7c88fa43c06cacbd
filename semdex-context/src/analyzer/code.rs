//! Full-grammar analyzer backed by tree-sitter.
//!
//! The concrete syntax tree is converted into the generic [`SourceNode`] tree
//! (named nodes only, grammar field labels preserved), and all extraction
//! runs over that tree. A node's `name` is filled from its `name` field and
//! leaf nodes keep their source text.

use super::LanguageAnalyzer;
use crate::error::{AnalysisError, Result};
use crate::unit::{
    MODULE_SCOPE, RelationKind, Relationship, SourceNode, SourceUnit, Span, Symbol, SymbolKind,
    Traversal,
};
use serde::Serialize;
use tree_sitter::{Node, Parser, Tree};

/// Grammars the code analyzer can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeLanguage {
    JavaScript,
    TypeScript,
    Python,
    Rust,
}

/// Node kinds that matter for extraction in one grammar.
struct NodeKinds {
    functions: &'static [&'static str],
    classes: &'static [&'static str],
    modules: &'static [&'static str],
    type_declarations: &'static [&'static str],
    calls: &'static [&'static str],
    constructions: &'static [&'static str],
    bindings: &'static [&'static str],
    closures: &'static [&'static str],
}

const JAVASCRIPT_KINDS: NodeKinds = NodeKinds {
    functions: &[
        "function_declaration",
        "generator_function_declaration",
        "method_definition",
    ],
    classes: &["class_declaration", "class"],
    modules: &[],
    type_declarations: &[],
    calls: &["call_expression"],
    constructions: &["new_expression"],
    bindings: &["variable_declarator"],
    closures: &[
        "arrow_function",
        "function_expression",
        "function",
        "generator_function",
    ],
};

const TYPESCRIPT_KINDS: NodeKinds = NodeKinds {
    functions: &[
        "function_declaration",
        "generator_function_declaration",
        "method_definition",
    ],
    classes: &[
        "class_declaration",
        "abstract_class_declaration",
        "class",
        "enum_declaration",
    ],
    modules: &["internal_module", "module"],
    type_declarations: &["interface_declaration", "type_alias_declaration"],
    calls: &["call_expression"],
    constructions: &["new_expression"],
    bindings: &["variable_declarator"],
    closures: &[
        "arrow_function",
        "function_expression",
        "function",
        "generator_function",
    ],
};

const PYTHON_KINDS: NodeKinds = NodeKinds {
    functions: &["function_definition"],
    classes: &["class_definition"],
    modules: &[],
    type_declarations: &[],
    calls: &["call"],
    constructions: &[],
    bindings: &["assignment"],
    closures: &["lambda"],
};

const RUST_KINDS: NodeKinds = NodeKinds {
    functions: &["function_item", "function_signature_item"],
    classes: &["struct_item", "enum_item", "union_item", "trait_item", "impl_item"],
    modules: &["mod_item"],
    type_declarations: &["type_item"],
    calls: &["call_expression", "macro_invocation"],
    constructions: &["struct_expression"],
    bindings: &["let_declaration"],
    closures: &["closure_expression"],
};

/// Statement-level wrappers whose span should stand in for the declaration
/// they wrap, so that `export`, decorators and `const f =` stay in the chunk.
const WRAPPER_KINDS: &[&str] = &[
    "export_statement",
    "decorated_definition",
    "lexical_declaration",
    "variable_declaration",
    "expression_statement",
];

impl CodeLanguage {
    pub fn tag(self) -> &'static str {
        match self {
            Self::JavaScript => crate::language::JAVASCRIPT,
            Self::TypeScript => crate::language::TYPESCRIPT,
            Self::Python => crate::language::PYTHON,
            Self::Rust => crate::language::RUST,
        }
    }

    fn grammar(self, filename: &str) -> tree_sitter::Language {
        match self {
            Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Self::TypeScript if filename.ends_with(".tsx") => {
                tree_sitter_typescript::LANGUAGE_TSX.into()
            }
            Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Self::Python => tree_sitter_python::LANGUAGE.into(),
            Self::Rust => tree_sitter_rust::LANGUAGE.into(),
        }
    }

    fn kinds(self) -> &'static NodeKinds {
        match self {
            Self::JavaScript => &JAVASCRIPT_KINDS,
            Self::TypeScript => &TYPESCRIPT_KINDS,
            Self::Python => &PYTHON_KINDS,
            Self::Rust => &RUST_KINDS,
        }
    }
}

/// A variable bound inside a scope, with a best-effort type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableBinding {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inferred_type: Option<String>,
    pub line: usize,
}

/// Variables declared directly in one function (or at module level).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableScope {
    pub owner: String,
    pub span: Span,
    pub variables: Vec<VariableBinding>,
}

#[derive(Debug, Clone)]
pub struct CodeAnalyzer {
    language: CodeLanguage,
}

impl CodeAnalyzer {
    pub fn new(language: CodeLanguage) -> Self {
        Self { language }
    }

    pub fn language(&self) -> CodeLanguage {
        self.language
    }

    fn kinds(&self) -> &'static NodeKinds {
        self.language.kinds()
    }

    /// Per-scope variable tables with types inferred from literals,
    /// constructor calls and explicit annotations.
    pub fn extract_scopes(&self, unit: &SourceUnit) -> Vec<VariableScope> {
        let kinds = self.kinds();
        let mut scopes = vec![VariableScope {
            owner: MODULE_SCOPE.to_string(),
            span: unit.root.span,
            variables: Vec::new(),
        }];

        let mut stack: Vec<(&SourceNode, usize)> = vec![(&unit.root, 0)];
        while let Some((node, scope)) = stack.pop() {
            let kind = node.kind.as_str();
            let mut child_scope = scope;

            if kinds.functions.contains(&kind) || kinds.closures.contains(&kind) {
                let owner = node
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("<closure@{}>", node.span.start_line));
                scopes.push(VariableScope {
                    owner,
                    span: node.span,
                    variables: Vec::new(),
                });
                child_scope = scopes.len() - 1;
            } else if kinds.bindings.contains(&kind) {
                if let Some((name, value)) = self.binding_parts(node) {
                    let annotated = node.child_by_field("type").and_then(leaf_text);
                    let inferred_type = annotated
                        .map(|t| t.trim_start_matches(':').trim().to_string())
                        .or_else(|| value.and_then(|v| self.infer_type(v)));
                    scopes[scope].variables.push(VariableBinding {
                        name: name.to_string(),
                        inferred_type,
                        line: node.span.start_line,
                    });
                }
            }

            for child in node.children.iter().rev() {
                stack.push((child, child_scope));
            }
        }

        scopes
    }

    /// Name and value of a binding node, when the bound pattern is a plain identifier.
    fn binding_parts<'a>(&self, node: &'a SourceNode) -> Option<(&'a str, Option<&'a SourceNode>)> {
        let (target_field, value_field) = match self.language {
            CodeLanguage::JavaScript | CodeLanguage::TypeScript => ("name", "value"),
            CodeLanguage::Python => ("left", "right"),
            CodeLanguage::Rust => ("pattern", "value"),
        };
        let target = node.child_by_field(target_field)?;
        let name = match target.kind.as_str() {
            "identifier" => target.text.as_deref()?,
            "mut_pattern" => leaf_text(target)?,
            _ => return None,
        };
        Some((name, node.child_by_field(value_field)))
    }

    fn infer_type(&self, value: &SourceNode) -> Option<String> {
        let kind = value.kind.as_str();
        let inferred = match self.language {
            CodeLanguage::JavaScript | CodeLanguage::TypeScript => match kind {
                "string" | "template_string" => "string",
                "number" => "number",
                "true" | "false" => "boolean",
                "null" | "undefined" => "null",
                "array" => "array",
                "object" => "object",
                "regex" => "regexp",
                "arrow_function" | "function_expression" | "function" => "function",
                "new_expression" => {
                    return value.child_by_field("constructor").and_then(leaf_text).map(str::to_string);
                }
                _ => return None,
            },
            CodeLanguage::Python => match kind {
                "string" | "concatenated_string" => "str",
                "integer" => "int",
                "float" => "float",
                "true" | "false" => "bool",
                "none" => "None",
                "list" | "list_comprehension" => "list",
                "dictionary" | "dictionary_comprehension" => "dict",
                "tuple" => "tuple",
                "set" | "set_comprehension" => "set",
                "lambda" => "function",
                "call" => {
                    let callee = value.child_by_field("function").and_then(leaf_text)?;
                    return callee
                        .starts_with(|c: char| c.is_ascii_uppercase())
                        .then(|| callee.to_string());
                }
                _ => return None,
            },
            CodeLanguage::Rust => match kind {
                "string_literal" | "raw_string_literal" => "&str",
                "integer_literal" => "integer",
                "float_literal" => "float",
                "boolean_literal" => "bool",
                "char_literal" => "char",
                "array_expression" => "array",
                "closure_expression" => "closure",
                "struct_expression" => {
                    return value.child_by_field("name").and_then(leaf_text).map(str::to_string);
                }
                "call_expression" => {
                    let function = value.child_by_field("function")?;
                    if function.kind != "scoped_identifier" {
                        return None;
                    }
                    return function.child_by_field("path").and_then(leaf_text).map(str::to_string);
                }
                "macro_invocation" => {
                    let name = value.child_by_field("macro").and_then(leaf_text)?;
                    return (name == "vec").then(|| "Vec".to_string());
                }
                _ => return None,
            },
        };
        Some(inferred.to_string())
    }

    fn parameters(&self, node: &SourceNode) -> Vec<String> {
        let Some(list) = node
            .child_by_field("parameters")
            .or_else(|| node.child_by_field("parameter"))
        else {
            return Vec::new();
        };
        if list.kind.ends_with("identifier") {
            // single bare parameter, e.g. `x => x`
            return list.text.iter().cloned().collect();
        }
        list.children
            .iter()
            .filter(|p| !p.kind.contains("comment"))
            .filter_map(parameter_name)
            .collect()
    }

    /// Visit nodes with the enclosing container and function names resolved.
    fn walk_declarations<'a>(&self, unit: &'a SourceUnit, mut visit: impl FnMut(DeclarationVisit<'a>)) {
        let kinds = self.kinds();
        let mut stack = vec![Frame {
            node: &unit.root,
            parent: None,
            container: None,
            function: None,
        }];

        while let Some(frame) = stack.pop() {
            let node = frame.node;
            let kind = node.kind.as_str();
            let mut container = frame.container.clone();
            let mut function = frame.function.clone();
            let mut declared = None;

            if kinds.functions.contains(&kind) {
                if let Some(name) = declaration_name(node) {
                    let symbol_kind = match (&frame.container, &frame.function) {
                        (Some(_), None) if is_constructor_name(name) => SymbolKind::Constructor,
                        (Some(_), None) => SymbolKind::Method,
                        _ => SymbolKind::Function,
                    };
                    declared = Some((name.to_string(), symbol_kind, node));
                    function = Some(name.to_string());
                }
            } else if kinds.bindings.contains(&kind) {
                if let Some((name, Some(value))) = self.binding_parts(node) {
                    if kinds.closures.contains(&value.kind.as_str()) {
                        declared = Some((name.to_string(), SymbolKind::Function, value));
                        function = Some(name.to_string());
                    }
                }
            } else if kinds.classes.contains(&kind)
                || kinds.modules.contains(&kind)
                || kinds.type_declarations.contains(&kind)
            {
                if let Some(name) = declaration_name(node) {
                    let symbol_kind = if kinds.modules.contains(&kind) {
                        SymbolKind::Module
                    } else if kinds.type_declarations.contains(&kind) {
                        SymbolKind::Type
                    } else {
                        SymbolKind::Class
                    };
                    declared = Some((name.to_string(), symbol_kind, node));
                    container = Some(name.to_string());
                    function = None;
                }
            }

            visit(DeclarationVisit {
                node,
                parent: frame.parent,
                declared,
                container: frame.container.clone(),
                function: frame.function.clone(),
            });

            for child in node.children.iter().rev() {
                stack.push(Frame {
                    node: child,
                    parent: Some(node),
                    container: container.clone(),
                    function: function.clone(),
                });
            }
        }
    }
}

struct Frame<'a> {
    node: &'a SourceNode,
    parent: Option<&'a SourceNode>,
    container: Option<String>,
    function: Option<String>,
}

struct DeclarationVisit<'a> {
    node: &'a SourceNode,
    parent: Option<&'a SourceNode>,
    /// (name, kind, node carrying the parameter list)
    declared: Option<(String, SymbolKind, &'a SourceNode)>,
    container: Option<String>,
    function: Option<String>,
}

impl LanguageAnalyzer for CodeAnalyzer {
    fn name(&self) -> &'static str {
        "code"
    }

    fn parse(&self, text: &str, filename: &str) -> Result<SourceUnit> {
        let mut parser = Parser::new();
        parser
            .set_language(&self.language.grammar(filename))
            .map_err(|_| AnalysisError::unsupported(self.language.tag(), filename))?;

        let tree = parser.parse(text, None).ok_or_else(|| {
            AnalysisError::malformed(self.language.tag(), filename, "parser produced no tree")
        })?;

        if tree.root_node().has_error() {
            tracing::debug!(file = filename, "syntax errors present, keeping partial tree");
        }

        Ok(SourceUnit {
            language: self.language.tag().to_string(),
            path: filename.to_string(),
            line_count: text.lines().count(),
            root: convert_tree(&tree, text.as_bytes()),
        })
    }

    fn extract_functions(&self, unit: &SourceUnit) -> Vec<Symbol> {
        let mut symbols = Vec::new();
        self.walk_declarations(unit, |visit| {
            let Some((name, kind, params_node)) = visit.declared else {
                return;
            };
            let span = match visit.parent {
                Some(parent) if WRAPPER_KINDS.contains(&parent.kind.as_str()) => parent.span,
                _ => visit.node.span,
            };
            let mut symbol = Symbol::new(name, kind, unit.path.clone(), span)
                .with_container(if kind.is_container() { None } else { visit.container });
            if kind.is_callable() {
                symbol = symbol.with_parameters(self.parameters(params_node));
            }
            symbols.push(symbol);
        });
        symbols
    }

    fn extract_relationships(&self, unit: &SourceUnit) -> Vec<Relationship> {
        let kinds = self.kinds();
        let mut relationships = Vec::new();
        self.walk_declarations(unit, |visit| {
            let kind = visit.node.kind.as_str();
            let (target, relation) = if kinds.calls.contains(&kind) {
                (callee_name(visit.node), RelationKind::Call)
            } else if kinds.constructions.contains(&kind) {
                let target = visit
                    .node
                    .child_by_field("constructor")
                    .or_else(|| visit.node.child_by_field("name"))
                    .and_then(leaf_text)
                    .map(str::to_string);
                (target, RelationKind::Reference)
            } else {
                return;
            };
            let Some(target) = target else {
                return;
            };
            let source = visit
                .function
                .or(visit.container)
                .unwrap_or_else(|| MODULE_SCOPE.to_string());
            relationships.push(Relationship {
                source,
                target,
                kind: relation,
                line: visit.node.span.start_line,
            });
        });
        relationships
    }

    fn traverse_nodes<'a>(&self, unit: &'a SourceUnit) -> Traversal<'a> {
        unit.nodes()
    }
}

fn is_constructor_name(name: &str) -> bool {
    matches!(name, "constructor" | "__init__")
}

fn declaration_name(node: &SourceNode) -> Option<&str> {
    node.name
        .as_deref()
        .or_else(|| node.child_by_field("type").and_then(leaf_text))
}

/// Text of the node if it is a leaf, otherwise of its first leaf descendant.
fn leaf_text(node: &SourceNode) -> Option<&str> {
    Traversal::new(node).find_map(|visited| visited.node.text.as_deref())
}

fn parameter_name(node: &SourceNode) -> Option<String> {
    match node.kind.as_str() {
        "self_parameter" => return Some("self".to_string()),
        kind if kind.ends_with("identifier") => return node.text.clone(),
        _ => {}
    }
    for field in ["name", "pattern", "left"] {
        if let Some(inner) = node.child_by_field(field) {
            return parameter_name(inner);
        }
    }
    leaf_text(node).map(str::to_string)
}

fn callee_name(call: &SourceNode) -> Option<String> {
    if call.kind == "macro_invocation" {
        return call
            .child_by_field("macro")
            .and_then(leaf_text)
            .map(|name| format!("{name}!"));
    }
    let mut callee = call.child_by_field("function")?;
    loop {
        if callee.text.is_some() {
            return callee.text.clone();
        }
        callee = ["property", "attribute", "field", "name", "function"]
            .iter()
            .find_map(|field| callee.child_by_field(field))?;
    }
}

fn convert_node(node: Node<'_>, field: Option<&str>, source: &[u8]) -> SourceNode {
    let start = node.start_position();
    let end = node.end_position();
    let end_line = if end.column == 0 && end.row > start.row {
        end.row
    } else {
        end.row + 1
    };
    let mut converted = SourceNode::new(
        node.kind(),
        Span::new(start.row + 1, end_line, node.start_byte(), node.end_byte()),
    );
    converted.field = field.map(str::to_string);
    if node.named_child_count() == 0 {
        converted.text = node.utf8_text(source).ok().map(str::to_string);
    }
    converted
}

/// Pop the finished top of the stack and attach it to its parent.
fn attach_top(stack: &mut Vec<SourceNode>) {
    if stack.len() < 2 {
        return;
    }
    if let Some(done) = stack.pop() {
        if let Some(parent) = stack.last_mut() {
            if parent.name.is_none() && done.field.as_deref() == Some("name") {
                parent.name = leaf_text(&done).map(str::to_string);
            }
            parent.children.push(done);
        }
    }
}

/// Iterative conversion, so pathological nesting cannot overflow the stack.
fn convert_tree(tree: &Tree, source: &[u8]) -> SourceNode {
    let mut cursor = tree.walk();
    let mut stack = vec![convert_node(cursor.node(), None, source)];

    if cursor.goto_first_child() {
        'walk: loop {
            let node = cursor.node();
            if node.is_named() {
                stack.push(convert_node(node, cursor.field_name(), source));
                if cursor.goto_first_child() {
                    continue;
                }
                attach_top(&mut stack);
            }
            loop {
                if cursor.goto_next_sibling() {
                    break;
                }
                if !cursor.goto_parent() || stack.len() == 1 {
                    break 'walk;
                }
                attach_top(&mut stack);
            }
        }
    }

    while stack.len() > 1 {
        attach_top(&mut stack);
    }
    stack.pop().unwrap_or_default()
}
