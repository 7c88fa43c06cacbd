//! Language tags and detection by extension and content sniffing.

use std::path::Path;

pub const GENERAL_CODE: &str = "general-code";
pub const JAVASCRIPT: &str = "javascript";
pub const TYPESCRIPT: &str = "typescript";
pub const PYTHON: &str = "python";
pub const RUST: &str = "rust";
pub const FLOW: &str = "flow";
pub const DECLARATIVE_TYPES: &str = "declarative-types";
pub const MARKDOWN: &str = "markdown";
pub const TEXT: &str = "text";

/// Languages handled by the regex heuristic analyzer.
pub const HEURISTIC_LANGUAGES: &[&str] = &[
    "java", "csharp", "c", "cpp", "go", "apex", "php", "kotlin", "swift", "ruby", "scala", "shell",
    "sql",
];

/// Detect the language tag for a file.
///
/// The extension decides when it is known. Otherwise the first bytes of the
/// content are sniffed for an XML prolog, a markup root element or a shebang.
/// Anything unrecognized is [`TEXT`].
///
/// # Examples
/// ```
/// use std::path::Path;
/// use semdex_context::language::detect_language;
///
/// assert_eq!(detect_language(Path::new("src/app.js"), ""), "javascript");
/// assert_eq!(detect_language(Path::new("types/index.d.ts"), ""), "declarative-types");
/// assert_eq!(detect_language(Path::new("run"), "#!/usr/bin/env python3\n"), "python");
/// ```
pub fn detect_language(path: &Path, content: &str) -> String {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if file_name.ends_with(".d.ts") || file_name.ends_with(".types") {
        return DECLARATIVE_TYPES.to_string();
    }

    let by_extension = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("js" | "mjs" | "cjs" | "jsx") => Some(JAVASCRIPT),
        Some("ts" | "tsx" | "mts" | "cts") => Some(TYPESCRIPT),
        Some("py" | "pyw") => Some(PYTHON),
        Some("rs") => Some(RUST),
        Some("xml" | "bpmn" | "flow" | "xaml" | "dmn") => Some(FLOW),
        Some("md" | "markdown") => Some(MARKDOWN),
        Some("txt" | "rst") => Some(TEXT),
        Some("java") => Some("java"),
        Some("cs") => Some("csharp"),
        Some("c" | "h") => Some("c"),
        Some("cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx") => Some("cpp"),
        Some("go") => Some("go"),
        Some("cls" | "trigger") => Some("apex"),
        Some("php") => Some("php"),
        Some("kt" | "kts") => Some("kotlin"),
        Some("swift") => Some("swift"),
        Some("rb") => Some("ruby"),
        Some("scala") => Some("scala"),
        Some("sh" | "bash" | "zsh") => Some("shell"),
        Some("sql") => Some("sql"),
        _ => None,
    };

    if let Some(language) = by_extension {
        return language.to_string();
    }

    sniff_content(content).to_string()
}

fn sniff_content(content: &str) -> &'static str {
    let head = content.trim_start();
    if let Some(shebang) = head.strip_prefix("#!") {
        let interpreter = shebang.lines().next().unwrap_or_default();
        if interpreter.contains("python") {
            return PYTHON;
        }
        if interpreter.contains("node") || interpreter.contains("deno") {
            return JAVASCRIPT;
        }
        if interpreter.contains("sh") {
            return "shell";
        }
    }
    if head.starts_with("<?xml") || (head.starts_with('<') && head.contains("</")) {
        return FLOW;
    }
    TEXT
}

/// Whether the language is prose rather than code.
pub fn is_prose(language: &str) -> bool {
    matches!(language, MARKDOWN | TEXT)
}
