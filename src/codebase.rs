//! Codebase scanner.
//!
//! Walks a source tree and produces the `codebase` ingest payload: one
//! whole-file entity per matching file plus one entity per extracted symbol
//! (functions, type definitions, and the top-of-file comment block). Symbols
//! are found with per-language regexes; there is no parsing.
//!
//! Whole-file content is cut to half of the file's length to keep embedding
//! requests small. Symbol entities carry a short excerpt starting at the
//! definition line.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

use crate::normalize::entity_id;

/// Lines of source kept for each symbol entity.
const SYMBOL_EXCERPT_LINES: usize = 12;

const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Java,
    Go,
    C,
    Cpp,
}

impl Language {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "rs" => Some(Language::Rust),
            "py" => Some(Language::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(Language::JavaScript),
            "ts" | "tsx" => Some(Language::TypeScript),
            "java" => Some(Language::Java),
            "go" => Some(Language::Go),
            "c" | "h" => Some(Language::C),
            "cc" | "cpp" | "cxx" | "hpp" | "hh" => Some(Language::Cpp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Java => "java",
            Language::Go => "go",
            Language::C => "c",
            Language::Cpp => "cpp",
        }
    }

    /// Line-comment markers, longest first.
    fn comment_markers(&self) -> &'static [&'static str] {
        match self {
            Language::Python => &["#"],
            Language::Rust => &["//!", "///", "//"],
            _ => &["//", "/**", "/*", "*/", "*"],
        }
    }
}

/// One raw codebase record, serialized into the `entities` array.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    pub language: Language,
    pub doc: String,
    pub content: String,
}

struct SymbolPattern {
    regex: Regex,
    /// Used when the regex has no `kind` capture group.
    default_kind: &'static str,
}

/// Compiled symbol regexes for every supported language.
pub struct SymbolExtractor {
    patterns: BTreeMap<Language, Vec<SymbolPattern>>,
}

impl SymbolExtractor {
    pub fn new() -> Result<Self> {
        let table: &[(Language, &str, &str)] = &[
            (
                Language::Rust,
                r"(?m)^[ \t]*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+\S+\s+)?fn\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                "function",
            ),
            (
                Language::Rust,
                r"(?m)^[ \t]*(?:pub(?:\([^)]*\))?\s+)?(?P<kind>struct|enum|trait)\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                "class",
            ),
            (
                Language::Python,
                r"(?m)^[ \t]*(?:async\s+)?def\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                "function",
            ),
            (
                Language::Python,
                r"(?m)^[ \t]*class\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                "class",
            ),
            (
                Language::Go,
                r"(?m)^func\s+(?:\([^)]*\)\s*)?(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                "function",
            ),
            (
                Language::Go,
                r"(?m)^type\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s+(?P<kind>struct|interface)",
                "class",
            ),
            (
                Language::Java,
                r"(?m)^[ \t]*(?:(?:public|protected|private|static|final|abstract)\s+)*(?P<kind>class|interface|enum)\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                "class",
            ),
            (
                Language::Java,
                r"(?m)^[ \t]*(?:(?:public|protected|private|static|final|abstract|synchronized)\s+)+[A-Za-z0-9_<>\[\],.? ]+?\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s*\(",
                "function",
            ),
            (
                Language::C,
                r"(?m)^[A-Za-z_][A-Za-z0-9_ \t\*]*?[ \t\*](?P<name>[A-Za-z_][A-Za-z0-9_]*)\s*\([^;{]*\)\s*\{?\s*$",
                "function",
            ),
            (
                Language::C,
                r"(?m)^[ \t]*(?:typedef\s+)?(?P<kind>struct)\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s*\{",
                "class",
            ),
            (
                Language::Cpp,
                r"(?m)^[A-Za-z_][A-Za-z0-9_: \t\*&<>,]*?[ \t\*&](?P<name>[A-Za-z_][A-Za-z0-9_:~]*)\s*\([^;{]*\)\s*(?:const\s*)?\{?\s*$",
                "function",
            ),
            (
                Language::Cpp,
                r"(?m)^[ \t]*(?:template\s*<[^>]*>\s*)?(?P<kind>class|struct)\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)[^;]*$",
                "class",
            ),
        ];

        let js_function = r"(?m)^[ \t]*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*(?P<name>[A-Za-z_$][A-Za-z0-9_$]*)";
        let js_arrow = r"(?m)^[ \t]*(?:export\s+)?(?:const|let|var)\s+(?P<name>[A-Za-z_$][A-Za-z0-9_$]*)\s*=\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][A-Za-z0-9_$]*)\s*=>";
        let js_class = r"(?m)^[ \t]*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?(?P<kind>class|interface)\s+(?P<name>[A-Za-z_$][A-Za-z0-9_$]*)";

        let mut patterns: BTreeMap<Language, Vec<SymbolPattern>> = BTreeMap::new();
        for (lang, pattern, default_kind) in table {
            patterns.entry(*lang).or_default().push(SymbolPattern {
                regex: Regex::new(pattern)?,
                default_kind,
            });
        }
        for lang in [Language::JavaScript, Language::TypeScript] {
            let entry = patterns.entry(lang).or_default();
            entry.push(SymbolPattern {
                regex: Regex::new(js_function)?,
                default_kind: "function",
            });
            entry.push(SymbolPattern {
                regex: Regex::new(js_arrow)?,
                default_kind: "function",
            });
            entry.push(SymbolPattern {
                regex: Regex::new(js_class)?,
                default_kind: "class",
            });
        }

        Ok(Self { patterns })
    }

    /// Extract symbol entities from one file's content.
    pub fn extract(&self, language: Language, file_path: &str, content: &str) -> Vec<CodeEntity> {
        let lines: Vec<&str> = content.lines().collect();
        let line_starts = line_starts(content);
        let mut entities = Vec::new();

        if let Some(header) = leading_comment(language, &lines) {
            entities.push(CodeEntity {
                id: entity_id("comment", "header", file_path, Some(1)),
                kind: "comment".to_string(),
                name: "header".to_string(),
                file_path: file_path.to_string(),
                line: Some(1),
                language,
                doc: String::new(),
                content: header,
            });
        }

        let Some(patterns) = self.patterns.get(&language) else {
            return entities;
        };

        let mut seen = std::collections::HashSet::new();
        for pattern in patterns {
            for caps in pattern.regex.captures_iter(content) {
                let Some(name) = caps.name("name") else {
                    continue;
                };
                if is_keyword(name.as_str()) {
                    continue;
                }
                let kind = caps
                    .name("kind")
                    .map(|k| k.as_str())
                    .unwrap_or(pattern.default_kind);
                let line_idx = line_starts.partition_point(|&start| start <= name.start()) - 1;
                if !seen.insert((line_idx, name.as_str().to_string())) {
                    continue;
                }

                let line = line_idx as u64 + 1;
                entities.push(CodeEntity {
                    id: entity_id(kind, name.as_str(), file_path, Some(line)),
                    kind: kind.to_string(),
                    name: name.as_str().to_string(),
                    file_path: file_path.to_string(),
                    line: Some(line),
                    language,
                    doc: doc_above(language, &lines, line_idx),
                    content: excerpt(&lines, line_idx),
                });
            }
        }

        entities.sort_by_key(|e| e.line);
        entities
    }
}

fn is_keyword(name: &str) -> bool {
    matches!(
        name,
        "if" | "for" | "while" | "switch" | "return" | "catch" | "sizeof" | "else" | "new"
    )
}

/// Byte offset of the start of every line.
fn line_starts(content: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(content.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

fn strip_comment<'a>(language: Language, line: &'a str) -> Option<&'a str> {
    let trimmed = line.trim();
    language
        .comment_markers()
        .iter()
        .find_map(|marker| trimmed.strip_prefix(marker))
        .map(|rest| rest.trim())
}

/// The comment block at the top of a file, skipping a shebang and blank lines.
fn leading_comment(language: Language, lines: &[&str]) -> Option<String> {
    let mut block = Vec::new();
    let mut started = false;
    for (i, line) in lines.iter().enumerate() {
        if i == 0 && line.starts_with("#!") {
            continue;
        }
        if line.trim().is_empty() {
            if started {
                break;
            }
            continue;
        }
        match strip_comment(language, line) {
            Some(text) => {
                started = true;
                if !text.is_empty() {
                    block.push(text);
                }
            }
            None => break,
        }
    }
    if block.is_empty() {
        None
    } else {
        Some(block.join("\n"))
    }
}

/// Contiguous comment lines directly above `line_idx`.
fn doc_above(language: Language, lines: &[&str], line_idx: usize) -> String {
    let mut doc = Vec::new();
    let mut i = line_idx;
    while i > 0 {
        i -= 1;
        let line = lines[i].trim();
        // Attributes and decorators sit between docs and the item.
        if line.starts_with('@') || (language == Language::Rust && line.starts_with("#[")) {
            continue;
        }
        match strip_comment(language, line) {
            Some(text) => doc.push(text),
            None => break,
        }
    }
    doc.reverse();
    doc.retain(|l| !l.is_empty());
    doc.join("\n")
}

fn excerpt(lines: &[&str], line_idx: usize) -> String {
    let end = (line_idx + SYMBOL_EXCERPT_LINES).min(lines.len());
    lines[line_idx..end].join("\n")
}

/// First half of `content`, cut on a char boundary.
pub fn truncate_half(content: &str) -> &str {
    let mut cut = content.len() / 2;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    &content[..cut]
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn is_vcs_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| VCS_DIRS.contains(&name))
            .unwrap_or(false)
}

/// Walk `root` and return file and symbol entities for every matching file.
///
/// Paths are relative to `root` with `/` separators. Unreadable or non-UTF-8
/// files are skipped with a warning.
pub fn scan_codebase(root: &Path, include: &[String], exclude: &[String]) -> Result<Vec<CodeEntity>> {
    if !root.is_dir() {
        anyhow::bail!("Codebase root does not exist: {}", root.display());
    }

    let include_set = build_globset(include)?;
    let exclude_set = build_globset(exclude)?;
    let extractor = SymbolExtractor::new()?;
    let mut entities = Vec::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_vcs_dir(e));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        let Some(language) = Language::from_path(path) else {
            continue;
        };

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %rel_str, error = %e, "skipping unreadable file");
                continue;
            }
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        entities.push(CodeEntity {
            id: entity_id("file", &name, &rel_str, None),
            kind: "file".to_string(),
            name,
            file_path: rel_str.clone(),
            line: None,
            language,
            doc: String::new(),
            content: truncate_half(&content).to_string(),
        });
        entities.extend(extractor.extract(language, &rel_str, &content));
    }

    tracing::info!(root = %root.display(), entities = entities.len(), "scanned codebase");
    Ok(entities)
}

/// Wrap scanned entities in the `codebase` ingest payload shape.
pub fn to_payload(root: &Path, entities: &[CodeEntity]) -> Result<Value> {
    Ok(serde_json::json!({
        "root": root.display().to_string(),
        "entities": serde_json::to_value(entities)?,
    }))
}

/// Per-language counts for a scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CodebaseSummary {
    pub files: usize,
    pub symbols: usize,
    pub languages: BTreeMap<String, usize>,
}

pub fn summarize(entities: &[CodeEntity]) -> CodebaseSummary {
    let mut summary = CodebaseSummary::default();
    for entity in entities {
        if entity.kind == "file" {
            summary.files += 1;
            *summary
                .languages
                .entry(entity.language.as_str().to_string())
                .or_default() += 1;
        } else {
            summary.symbols += 1;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn globs(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rust_symbols_with_docs() {
        let src = "//! Cache layer.\n\nuse std::fmt;\n\n/// Builds things.\n#[derive(Debug)]\npub struct Builder {\n    x: u32,\n}\n\npub async fn run() {}\n\nfn main() {}\n";
        let extractor = SymbolExtractor::new().unwrap();
        let entities = extractor.extract(Language::Rust, "src/lib.rs", src);

        let names: Vec<_> = entities.iter().map(|e| (e.kind.as_str(), e.name.as_str())).collect();
        assert_eq!(
            names,
            vec![
                ("comment", "header"),
                ("struct", "Builder"),
                ("function", "run"),
                ("function", "main"),
            ]
        );
        assert_eq!(entities[0].content, "Cache layer.");
        assert_eq!(entities[1].doc, "Builds things.");
        assert_eq!(entities[1].id, "src/lib.rs::struct:Builder@7");
    }

    #[test]
    fn test_python_and_go_symbols() {
        let extractor = SymbolExtractor::new().unwrap();
        let py = "#!/usr/bin/env python\n# Tools module\n\nclass Agent:\n    def run(self):\n        pass\n";
        let entities = extractor.extract(Language::Python, "agent.py", py);
        let names: Vec<_> = entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["header", "Agent", "run"]);
        assert_eq!(entities[2].line, Some(5));

        let go = "package main\n\ntype Server struct {}\n\nfunc (s *Server) Start() error { return nil }\n";
        let entities = extractor.extract(Language::Go, "main.go", go);
        let names: Vec<_> = entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Server", "Start"]);
    }

    #[test]
    fn test_python_decorators_keep_comment_docs() {
        let extractor = SymbolExtractor::new().unwrap();
        let py = "import flask\n\n# Serve the landing page.\n@app.route('/')\n@login_required\ndef index():\n    pass\n";
        let entities = extractor.extract(Language::Python, "app.py", py);
        let index = entities.iter().find(|e| e.name == "index").unwrap();
        assert_eq!(index.doc, "Serve the landing page.");
    }

    #[test]
    fn test_truncate_half_respects_char_boundaries() {
        assert_eq!(truncate_half("abcd"), "ab");
        assert_eq!(truncate_half("aé"), "a");
        assert_eq!(truncate_half(""), "");
    }

    #[test]
    fn test_scan_skips_vcs_and_excluded_dirs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join(".git/hooks")).unwrap();
        std::fs::create_dir_all(root.join("target")).unwrap();
        std::fs::write(root.join("src/main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(root.join("src/util.rs"), "fn main() {}\n").unwrap();
        std::fs::write(root.join(".git/hooks/hook.py"), "def x(): pass\n").unwrap();
        std::fs::write(root.join("target/gen.rs"), "fn gen() {}\n").unwrap();
        std::fs::write(root.join("README.md"), "# readme\n").unwrap();

        let entities = scan_codebase(
            root,
            &globs(&["**/*.rs", "**/*.py", "**/*.md"]),
            &globs(&["**/target/**"]),
        )
        .unwrap();

        let files: Vec<_> = entities
            .iter()
            .filter(|e| e.kind == "file")
            .map(|e| e.file_path.as_str())
            .collect();
        assert_eq!(files, vec!["src/main.rs", "src/util.rs"]);

        // Two `main` functions in different files get distinct ids.
        let mains: Vec<_> = entities.iter().filter(|e| e.name == "main").collect();
        assert_eq!(mains.len(), 2);
        assert_ne!(mains[0].id, mains[1].id);

        let summary = summarize(&entities);
        assert_eq!(summary.files, 2);
        assert_eq!(summary.symbols, 2);
        assert_eq!(summary.languages["rust"], 2);
    }

    #[test]
    fn test_payload_shape_validates() {
        let entity = CodeEntity {
            id: "a.rs".into(),
            kind: "file".into(),
            name: "a.rs".into(),
            file_path: "a.rs".into(),
            line: None,
            language: Language::Rust,
            doc: String::new(),
            content: "fn".into(),
        };
        let payload = to_payload(Path::new("/repo"), &[entity]).unwrap();
        assert_eq!(payload["entities"][0]["type"], "file");
        assert!(
            crate::ingest::validate_payload(crate::models::SourceKind::Codebase, &payload).is_ok()
        );
    }
}
