//! Language analyzers.
//!
//! Four analyzers implement the same [`LanguageAnalyzer`] capability:
//!
//! - [`code::CodeAnalyzer`]: tree-sitter grammars for JavaScript/TypeScript, Python and Rust
//! - [`flow::FlowAnalyzer`]: markup flow documents (BPMN-like XML)
//! - [`types::TypeDeclAnalyzer`]: declarative type and alias definitions
//! - [`heuristic::HeuristicAnalyzer`]: ordered regex passes for everything else
//!
//! Which one runs for a file is a lookup by language tag in an
//! [`AnalyzerRegistry`].

pub mod code;
pub mod flow;
pub mod heuristic;
pub mod types;

use crate::error::Result;
use crate::language;
use crate::unit::{Relationship, SourceUnit, Symbol, Traversal};
use std::collections::HashMap;
use std::sync::Arc;

/// Shared capability set of every analyzer.
///
/// `parse` is the only fallible operation. Extraction works on an already
/// parsed unit and returns empty sequences when nothing matches.
pub trait LanguageAnalyzer: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    fn parse(&self, text: &str, filename: &str) -> Result<SourceUnit>;

    /// Function-like and class-like declarations found in the unit.
    fn extract_functions(&self, unit: &SourceUnit) -> Vec<Symbol>;

    fn extract_relationships(&self, unit: &SourceUnit) -> Vec<Relationship>;

    /// Pre-order walk of the unit. Each call starts over from the root.
    fn traverse_nodes<'a>(&self, unit: &'a SourceUnit) -> Traversal<'a> {
        unit.nodes()
    }
}

/// Everything one analysis pass produced for a file.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub unit: SourceUnit,
    pub symbols: Vec<Symbol>,
    pub relationships: Vec<Relationship>,
}

/// Parse `text` and run both extractions.
pub fn analyze(analyzer: &dyn LanguageAnalyzer, text: &str, filename: &str) -> Result<Analysis> {
    let unit = analyzer.parse(text, filename)?;
    let symbols = analyzer.extract_functions(&unit);
    let relationships = analyzer.extract_relationships(&unit);
    tracing::debug!(
        analyzer = analyzer.name(),
        file = filename,
        symbols = symbols.len(),
        relationships = relationships.len(),
        "analyzed file"
    );
    Ok(Analysis {
        unit,
        symbols,
        relationships,
    })
}

/// Analyzers keyed by language tag.
#[derive(Clone, Default)]
pub struct AnalyzerRegistry {
    analyzers: HashMap<String, Arc<dyn LanguageAnalyzer>>,
}

impl std::fmt::Debug for AnalyzerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut languages: Vec<_> = self.analyzers.keys().collect();
        languages.sort();
        f.debug_struct("AnalyzerRegistry")
            .field("languages", &languages)
            .finish()
    }
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in analyzer registered for its languages.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        let javascript: Arc<dyn LanguageAnalyzer> =
            Arc::new(code::CodeAnalyzer::new(code::CodeLanguage::JavaScript));
        registry.register(language::GENERAL_CODE, javascript.clone());
        registry.register(language::JAVASCRIPT, javascript);
        registry.register(
            language::TYPESCRIPT,
            Arc::new(code::CodeAnalyzer::new(code::CodeLanguage::TypeScript)),
        );
        registry.register(
            language::PYTHON,
            Arc::new(code::CodeAnalyzer::new(code::CodeLanguage::Python)),
        );
        registry.register(
            language::RUST,
            Arc::new(code::CodeAnalyzer::new(code::CodeLanguage::Rust)),
        );
        registry.register(language::FLOW, Arc::new(flow::FlowAnalyzer::default()));
        registry.register(
            language::DECLARATIVE_TYPES,
            Arc::new(types::TypeDeclAnalyzer::new()),
        );

        let heuristic: Arc<dyn LanguageAnalyzer> = Arc::new(heuristic::HeuristicAnalyzer::new());
        for tag in language::HEURISTIC_LANGUAGES {
            registry.register(tag, heuristic.clone());
        }

        registry
    }

    pub fn register(&mut self, language: &str, analyzer: Arc<dyn LanguageAnalyzer>) {
        self.analyzers.insert(language.to_string(), analyzer);
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn LanguageAnalyzer>> {
        self.analyzers.get(language).cloned()
    }

    pub fn languages(&self) -> Vec<&str> {
        let mut languages: Vec<&str> = self.analyzers.keys().map(String::as_str).collect();
        languages.sort_unstable();
        languages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_covers_builtin_languages() {
        let registry = AnalyzerRegistry::with_defaults();
        assert_eq!(registry.get("general-code").map(|a| a.name()), Some("code"));
        assert_eq!(registry.get("flow").map(|a| a.name()), Some("flow"));
        assert_eq!(
            registry.get("declarative-types").map(|a| a.name()),
            Some("types")
        );
        assert_eq!(registry.get("java").map(|a| a.name()), Some("heuristic"));
        assert!(registry.get("markdown").is_none());
    }
}
