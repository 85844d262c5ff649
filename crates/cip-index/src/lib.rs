//! Symbol and call-site index over a repository's Python sources.

use anyhow::{Result, anyhow};
use cip_core::AstSpan;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use streaming_iterator::StreamingIterator;
use tree_sitter::{Language, Parser, Query, QueryCursor};
use walkdir::WalkDir;

const PYTHON_QUERY: &str = r#"
(function_definition name: (identifier) @name) @definition.function
(class_definition name: (identifier) @name) @definition.class
(call function: (identifier) @callee) @call
(call function: (attribute attribute: (identifier) @callee)) @call
"#;

/// In-memory lookup from symbol names to definition spans and from callee
/// names to call-site spans, with padded slice access into cached sources.
pub struct AstIndex {
    root: PathBuf,
    symbols: HashMap<String, Vec<AstSpan>>,
    calls: HashMap<String, Vec<AstSpan>>,
    file_cache: HashMap<String, Vec<String>>,
}

impl AstIndex {
    /// Walk `repo` and index every parseable `*.py` file. Files the
    /// grammar cannot parse are skipped, not fatal.
    pub fn build(repo: &Path) -> Result<Self> {
        let language: Language = tree_sitter_python::LANGUAGE.into();
        let query = Query::new(&language, PYTHON_QUERY)
            .map_err(|e| anyhow!("python tags query failed to compile: {e}"))?;
        let mut parser = Parser::new();
        parser
            .set_language(&language)
            .map_err(|e| anyhow!("python grammar rejected: {e}"))?;

        let mut index = Self {
            root: repo.to_path_buf(),
            symbols: HashMap::new(),
            calls: HashMap::new(),
            file_cache: HashMap::new(),
        };

        for entry in WalkDir::new(repo).into_iter().filter_entry(|e| e.file_name() != ".git") {
            let entry = entry?;
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(|s| s.to_str()) != Some("py")
            {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(repo)?
                .to_string_lossy()
                .replace('\\', "/");
            let Ok(source) = fs::read_to_string(entry.path()) else {
                continue;
            };
            index
                .file_cache
                .insert(rel.clone(), source.lines().map(str::to_string).collect());
            index.scan_source(&mut parser, &query, &rel, &source);
        }
        Ok(index)
    }

    fn scan_source(&mut self, parser: &mut Parser, query: &Query, rel: &str, source: &str) {
        let Some(tree) = parser.parse(source, None) else {
            return;
        };
        let source_bytes = source.as_bytes();
        let capture_names = query.capture_names();
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(query, tree.root_node(), source_bytes);
        while let Some(m) = matches.next() {
            let mut name: Option<String> = None;
            let mut span: Option<(usize, usize, &'static str)> = None;
            for capture in m.captures {
                let capture_name = capture_names[capture.index as usize];
                match capture_name {
                    "name" | "callee" => {
                        name = capture
                            .node
                            .utf8_text(source_bytes)
                            .ok()
                            .map(str::to_string);
                    }
                    "definition.function" => {
                        span = Some((
                            capture.node.start_position().row + 1,
                            capture.node.end_position().row + 1,
                            "FunctionDef",
                        ));
                    }
                    "definition.class" => {
                        span = Some((
                            capture.node.start_position().row + 1,
                            capture.node.end_position().row + 1,
                            "ClassDef",
                        ));
                    }
                    "call" => {
                        span = Some((
                            capture.node.start_position().row + 1,
                            capture.node.end_position().row + 1,
                            "Call",
                        ));
                    }
                    _ => {}
                }
            }
            if let (Some(name), Some((start, end, node_type))) = (name, span) {
                let mut ast_span = AstSpan::new(rel, start, end, node_type);
                ast_span.symbol = Some(name.clone());
                let target = if node_type == "Call" {
                    &mut self.calls
                } else {
                    &mut self.symbols
                };
                target.entry(name).or_default().push(ast_span);
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lookup_symbol(&self, symbol: &str) -> &[AstSpan] {
        self.symbols.get(symbol).map_or(&[], Vec::as_slice)
    }

    pub fn lookup_calls(&self, name: &str) -> &[AstSpan] {
        self.calls.get(name).map_or(&[], Vec::as_slice)
    }

    /// The cached lines of `file`, if it was indexed.
    pub fn file_lines(&self, file: &str) -> Option<&[String]> {
        self.file_cache.get(file).map(Vec::as_slice)
    }

    /// Padded slice of `file` covering `start_line..=end_line`.
    pub fn slice(&self, file: &str, start_line: usize, end_line: usize, padding: usize) -> Option<String> {
        let lines = self.file_cache.get(file)?;
        let start = start_line.saturating_sub(1).saturating_sub(padding);
        let end = (end_line + padding).min(lines.len());
        if start >= end {
            return Some(String::new());
        }
        Some(lines[start..end].join("\n") + "\n")
    }

    /// Like [`slice`](Self::slice), with each line prefixed by its 1-based
    /// number, the shape proposal prompts consume.
    pub fn numbered_slice(&self, file: &str, start_line: usize, end_line: usize, padding: usize) -> Option<String> {
        let lines = self.file_cache.get(file)?;
        let start = start_line.saturating_sub(1).saturating_sub(padding);
        let end = (end_line + padding).min(lines.len());
        let mut out = String::new();
        for (offset, line) in lines[start.min(end)..end].iter().enumerate() {
            out.push_str(&format!("{:>5} | {}\n", start + offset + 1, line));
        }
        Some(out)
    }
}
