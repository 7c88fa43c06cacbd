//! Analyzer for structured flow documents.
//!
//! The markup is read into a generic element tree with quick-xml. Elements
//! whose local tag name is one of the configured node types are "recognized".
//! A recognized element gets a name (`name`, then `id`, then
//! `anonymous_<type>`), and if it carries an expression (an attribute from
//! the configured list, a text body, or an expression child element) it
//! becomes a pseudo-function symbol. Elements with a source/target attribute
//! pair that resolve to two recognized nodes become relationships.

use super::LanguageAnalyzer;
use crate::error::{AnalysisError, Result};
use crate::language::FLOW;
use crate::unit::{LineIndex, RelationKind, Relationship, SourceNode, SourceUnit, Span, Symbol, SymbolKind};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which parts of a flow document carry meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowAnalyzerConfig {
    /// Local tag names treated as first-class flow nodes
    pub node_types: Vec<String>,
    /// Attributes holding an embedded expression or script
    pub expression_attributes: Vec<String>,
    /// Child elements whose text is the node's expression body
    pub expression_elements: Vec<String>,
    /// Attributes naming the expression language
    pub language_attributes: Vec<String>,
    /// Source/target attribute pairs declaring a connection
    pub connection_attributes: Vec<(String, String)>,
    pub default_expression_language: String,
}

impl Default for FlowAnalyzerConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            node_types: strings(&[
                "task",
                "scriptTask",
                "serviceTask",
                "userTask",
                "businessRuleTask",
                "sendTask",
                "receiveTask",
                "manualTask",
                "callActivity",
                "subProcess",
                "startEvent",
                "endEvent",
                "intermediateCatchEvent",
                "intermediateThrowEvent",
                "boundaryEvent",
                "exclusiveGateway",
                "inclusiveGateway",
                "parallelGateway",
                "eventBasedGateway",
                "step",
                "action",
                "decision",
                "assignment",
                "transform",
                "component",
                "node",
            ]),
            expression_attributes: strings(&[
                "expression",
                "condition",
                "script",
                "code",
                "formula",
            ]),
            expression_elements: strings(&[
                "script",
                "expression",
                "condition",
                "conditionExpression",
                "code",
            ]),
            language_attributes: strings(&["language", "scriptFormat", "lang", "expressionLanguage"]),
            connection_attributes: vec![
                ("sourceRef".to_string(), "targetRef".to_string()),
                ("source".to_string(), "target".to_string()),
                ("from".to_string(), "to".to_string()),
            ],
            default_expression_language: "expression".to_string(),
        }
    }
}

impl FlowAnalyzerConfig {
    pub fn with_node_types(mut self, node_types: Vec<String>) -> Self {
        self.node_types = node_types;
        self
    }

    pub fn with_expression_attributes(mut self, attributes: Vec<String>) -> Self {
        self.expression_attributes = attributes;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowAnalyzer {
    config: FlowAnalyzerConfig,
}

impl FlowAnalyzer {
    pub fn new(config: FlowAnalyzerConfig) -> Self {
        Self { config }
    }

    fn is_recognized(&self, node: &SourceNode) -> bool {
        self.config.node_types.iter().any(|t| *t == node.kind)
    }

    /// Embedded expression of a recognized node and its language.
    fn expression_of(&self, node: &SourceNode) -> Option<(String, String)> {
        let from_attribute = self
            .config
            .expression_attributes
            .iter()
            .find_map(|attr| node.attribute(attr))
            .map(str::to_string);
        let from_body = || {
            node.text.clone().or_else(|| {
                node.children
                    .iter()
                    .filter(|child| self.config.expression_elements.contains(&child.kind))
                    .find_map(|child| child.text.clone())
            })
        };
        let expression = from_attribute
            .or_else(from_body)
            .filter(|e| !e.trim().is_empty())?;

        let language = std::iter::once(node)
            .chain(node.children.iter())
            .find_map(|n| {
                self.config
                    .language_attributes
                    .iter()
                    .find_map(|attr| n.attribute(attr))
            })
            .unwrap_or(&self.config.default_expression_language)
            .to_string();

        Some((expression, language))
    }

    /// Every recognized node as a component symbol, expression or not.
    pub fn extract_components(&self, unit: &SourceUnit) -> Vec<Symbol> {
        unit.nodes()
            .map(|visited| visited.node)
            .filter(|node| self.is_recognized(node))
            .filter_map(|node| {
                let name = node.name.clone()?;
                Some(Symbol::new(name, SymbolKind::Component, unit.path.clone(), node.span))
            })
            .collect()
    }

    fn element_node(&self, start: &BytesStart<'_>, span: Span, path: &str) -> Result<SourceNode> {
        let tag = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut node = SourceNode::new(tag, span);
        for attribute in start.attributes() {
            let attribute = attribute
                .map_err(|e| AnalysisError::malformed(FLOW, path, e.to_string()))?;
            let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|e| AnalysisError::malformed(FLOW, path, e.to_string()))?
                .into_owned();
            node.attributes.insert(key, value);
        }
        if self.is_recognized(&node) {
            let name = node
                .attribute("name")
                .or_else(|| node.attribute("id"))
                .map(str::to_string)
                .unwrap_or_else(|| format!("anonymous_{}", node.kind));
            node.name = Some(name);
        }
        Ok(node)
    }
}

fn append_text(node: &mut SourceNode, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    match &mut node.text {
        Some(existing) => {
            existing.push('\n');
            existing.push_str(text);
        }
        None => node.text = Some(text.to_string()),
    }
}

/// Close the top element at `end_byte` and attach it to its parent.
fn close_element(stack: &mut Vec<SourceNode>, lines: &LineIndex, end_byte: usize) {
    if stack.len() < 2 {
        return;
    }
    if let Some(mut done) = stack.pop() {
        done.span = lines.span(done.span.start_byte, end_byte);
        if let Some(parent) = stack.last_mut() {
            parent.children.push(done);
        }
    }
}

impl LanguageAnalyzer for FlowAnalyzer {
    fn name(&self) -> &'static str {
        "flow"
    }

    fn parse(&self, text: &str, filename: &str) -> Result<SourceUnit> {
        let lines = LineIndex::new(text);
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack = vec![SourceNode::new("document", lines.span(0, text.len()))];
        loop {
            let before = reader.buffer_position() as usize;
            let event = reader.read_event().map_err(|e| {
                AnalysisError::malformed(FLOW, filename, format!("after byte {before}: {e}"))
            })?;
            let after = reader.buffer_position() as usize;
            // Position before the event may still point at skipped whitespace.
            let tag_start = text
                .get(before..)
                .and_then(|rest| rest.find('<'))
                .map_or(before, |offset| before + offset);

            match event {
                Event::Start(start) => {
                    let node = self.element_node(&start, lines.span(tag_start, after), filename)?;
                    stack.push(node);
                }
                Event::Empty(start) => {
                    let node = self.element_node(&start, lines.span(tag_start, after), filename)?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(node);
                    }
                }
                Event::End(_) => close_element(&mut stack, &lines, after),
                Event::Text(content) => {
                    let content = content
                        .unescape()
                        .map_err(|e| AnalysisError::malformed(FLOW, filename, e.to_string()))?;
                    if let Some(top) = stack.last_mut() {
                        append_text(top, &content);
                    }
                }
                Event::CData(content) => {
                    if let Some(top) = stack.last_mut() {
                        append_text(top, &String::from_utf8_lossy(&content));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if stack.len() > 1 {
            let open = stack.last().map(|n| n.kind.clone()).unwrap_or_default();
            return Err(AnalysisError::malformed(
                FLOW,
                filename,
                format!("element <{open}> is never closed"),
            ));
        }

        Ok(SourceUnit {
            language: FLOW.to_string(),
            path: filename.to_string(),
            line_count: lines.line_count(),
            root: stack.pop().unwrap_or_default(),
        })
    }

    fn extract_functions(&self, unit: &SourceUnit) -> Vec<Symbol> {
        unit.nodes()
            .map(|visited| visited.node)
            .filter(|node| self.is_recognized(node))
            .filter_map(|node| {
                let name = node.name.clone()?;
                let (expression, language) = self.expression_of(node)?;
                let mut symbol = Symbol::new(name, SymbolKind::Function, unit.path.clone(), node.span);
                symbol.size = Some(expression.lines().count().max(1));
                symbol.expression_language = Some(language);
                symbol.definition = Some(expression);
                Some(symbol)
            })
            .collect()
    }

    fn extract_relationships(&self, unit: &SourceUnit) -> Vec<Relationship> {
        let mut names_by_ref: HashMap<&str, &str> = HashMap::new();
        for node in unit.nodes().map(|v| v.node).filter(|n| self.is_recognized(n)) {
            let Some(name) = node.name.as_deref() else {
                continue;
            };
            names_by_ref.insert(name, name);
            if let Some(id) = node.attribute("id") {
                names_by_ref.insert(id, name);
            }
        }

        let mut relationships = Vec::new();
        for node in unit.nodes().map(|v| v.node) {
            for (source_attr, target_attr) in &self.config.connection_attributes {
                let (Some(source), Some(target)) =
                    (node.attribute(source_attr), node.attribute(target_attr))
                else {
                    continue;
                };
                if let (Some(source), Some(target)) =
                    (names_by_ref.get(source), names_by_ref.get(target))
                {
                    relationships.push(Relationship {
                        source: source.to_string(),
                        target: target.to_string(),
                        kind: RelationKind::Reference,
                        line: node.span.start_line,
                    });
                }
                break;
            }
        }
        relationships
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_FLOW: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions>
  <process id="order">
    <startEvent id="start"/>
    <scriptTask id="t1" name="ComputeTotal" scriptFormat="javascript" expression="items.reduce((a, b) => a + b, 0)"/>
    <endEvent id="end"/>
    <sequenceFlow id="f1" sourceRef="start" targetRef="t1"/>
    <sequenceFlow id="f2" sourceRef="t1" targetRef="end"/>
    <sequenceFlow id="f3" sourceRef="t1" targetRef="nowhere"/>
  </process>
</definitions>
"#;

    #[test]
    fn test_expression_node_becomes_pseudo_function() {
        let analyzer = FlowAnalyzer::default();
        let unit = analyzer.parse(ORDER_FLOW, "order.bpmn").unwrap();
        let symbols = analyzer.extract_functions(&unit);

        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "ComputeTotal");
        assert_eq!(symbols[0].kind, SymbolKind::Function);
        assert_eq!(symbols[0].expression_language.as_deref(), Some("javascript"));
        assert_eq!(
            symbols[0].definition.as_deref(),
            Some("items.reduce((a, b) => a + b, 0)")
        );
        assert_eq!(symbols[0].span.start_line, 5);
    }

    #[test]
    fn test_connections_between_recognized_nodes() {
        let analyzer = FlowAnalyzer::default();
        let unit = analyzer.parse(ORDER_FLOW, "order.bpmn").unwrap();
        let relationships = analyzer.extract_relationships(&unit);

        let edges: Vec<_> = relationships
            .iter()
            .map(|r| (r.source.as_str(), r.target.as_str()))
            .collect();
        assert_eq!(edges, vec![("start", "ComputeTotal"), ("ComputeTotal", "end")]);
        assert!(relationships.iter().all(|r| r.kind == RelationKind::Reference));
    }

    #[test]
    fn test_anonymous_names_and_script_bodies() {
        let doc = r#"<flow>
  <decision>
    <condition language="feel">amount &gt; 100</condition>
  </decision>
  <step name="Notify"/>
</flow>"#;
        let analyzer = FlowAnalyzer::default();
        let unit = analyzer.parse(doc, "approve.flow").unwrap();

        let components = analyzer.extract_components(&unit);
        let names: Vec<_> = components.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["anonymous_decision", "Notify"]);

        let symbols = analyzer.extract_functions(&unit);
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "anonymous_decision");
        assert_eq!(symbols[0].definition.as_deref(), Some("amount > 100"));
        assert_eq!(symbols[0].expression_language.as_deref(), Some("feel"));
        assert_eq!((symbols[0].span.start_line, symbols[0].span.end_line), (2, 4));
    }

    #[test]
    fn test_invalid_markup_is_malformed() {
        let analyzer = FlowAnalyzer::default();
        let result = analyzer.parse("<flow><step></flow>", "bad.flow");
        assert!(matches!(result, Err(AnalysisError::Malformed { .. })));

        let result = analyzer.parse("<flow><step>", "open.flow");
        assert!(matches!(result, Err(AnalysisError::Malformed { .. })));
    }

    #[test]
    fn test_custom_node_types() {
        let config = FlowAnalyzerConfig::default().with_node_types(vec!["rule".to_string()]);
        let analyzer = FlowAnalyzer::new(config);
        let unit = analyzer
            .parse(r#"<rules><rule id="r1" condition="x == 1"/><task id="t"/></rules>"#, "r.xml")
            .unwrap();
        let symbols = analyzer.extract_functions(&unit);
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "r1");
        assert_eq!(symbols[0].expression_language.as_deref(), Some("expression"));
    }
}
