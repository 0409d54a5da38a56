//! Code search tool — symbol index, fuzzy name search, multi-strategy text
//! search, reference finding, and file outlines.
//!
//! The index is a per-workspace map from file path to the symbols found in
//! it, rebuilt incrementally by mtime. Builds are serialized by a `Mutex` so
//! concurrent triggers await the in-flight rebuild rather than racing it.

use crate::registry::{Tool, ToolResult};
use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::debug;
use walkdir::WalkDir;

const INDEX_TTL: Duration = Duration::from_secs(60);
const DEFAULT_EXCLUDES: &[&str] = &[
    ".git", "node_modules", "target", "dist", "build", ".next", "vendor",
];

#[derive(Clone, Debug, Serialize)]
pub struct Symbol {
    pub name: String,
    pub kind: &'static str,
    pub line: usize,
    pub column: usize,
    pub context: String,
}

#[derive(Clone, Debug)]
struct FileSymbols {
    symbols: Vec<Symbol>,
    indexed_mtime: SystemTime,
}

struct LanguageRules {
    extensions: &'static [&'static str],
    patterns: Vec<(&'static str, &'static str)>, // (kind, regex)
}

fn language_table() -> Vec<LanguageRules> {
    vec![
        LanguageRules {
            extensions: &["rs"],
            patterns: vec![
                ("function", r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+(\w+)"),
                ("type", r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait|union)\s+(\w+)"),
                ("type", r"^\s*(?:pub(?:\([^)]*\))?\s+)?type\s+(\w+)"),
                ("variable", r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const|static)\s+(\w+)"),
                ("import", r"^\s*use\s+([\w:]+)"),
                ("export", r"^\s*pub\s+mod\s+(\w+)"),
            ],
        },
        LanguageRules {
            extensions: &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
            patterns: vec![
                ("function", r"^\s*(?:export\s+)?(?:async\s+)?function\s*\*?\s+(\w+)"),
                ("class", r"^\s*(?:export\s+)?(?:default\s+)?class\s+(\w+)"),
                ("interface", r"^\s*(?:export\s+)?interface\s+(\w+)"),
                ("type", r"^\s*(?:export\s+)?type\s+(\w+)"),
                ("variable", r"^\s*(?:export\s+)?(?:const|let|var)\s+(\w+)\s*="),
                ("import", r#"^\s*import\s.*?from\s+['"]([^'"]+)['"]"#),
                ("export", r"^\s*export\s+\{([^}]+)\}"),
            ],
        },
        LanguageRules {
            extensions: &["py"],
            patterns: vec![
                ("function", r"^\s*(?:async\s+)?def\s+(\w+)"),
                ("class", r"^\s*class\s+(\w+)"),
                ("variable", r"^(\w+)\s*(?::\s*\w+)?\s*="),
                ("import", r"^\s*(?:from\s+[\w.]+\s+)?import\s+([\w., ]+)"),
            ],
        },
        LanguageRules {
            extensions: &["go"],
            patterns: vec![
                ("function", r"^\s*func\s+(?:\([^)]*\)\s*)?(\w+)"),
                ("type", r"^\s*type\s+(\w+)\s+(?:struct|interface)"),
                ("variable", r"^\s*(?:const|var)\s+(\w+)"),
                ("import", r#"^\s*import\s+"([^"]+)""#),
            ],
        },
        LanguageRules {
            extensions: &["java", "kt"],
            patterns: vec![
                ("function", r"^\s*(?:public|private|protected)?\s*(?:static\s+)?(?:fun|[\w<>\[\]]+)\s+(\w+)\s*\("),
                ("class", r"^\s*(?:public|private|protected)?\s*(?:abstract\s+)?class\s+(\w+)"),
                ("interface", r"^\s*(?:public\s+)?interface\s+(\w+)"),
                ("import", r"^\s*import\s+([\w.]+)"),
            ],
        },
        LanguageRules {
            extensions: &["c", "h", "cpp", "cc", "hpp", "cxx"],
            patterns: vec![
                ("function", r"^\s*(?:[\w:<>*&]+\s+)+(\w+)\s*\([^;{]*\)\s*\{?"),
                ("type", r"^\s*(?:struct|class|enum|union)\s+(\w+)"),
                ("import", r#"^\s*#include\s*[<"]([^>"]+)[>"]"#),
            ],
        },
        LanguageRules {
            extensions: &["rb"],
            patterns: vec![
                ("function", r"^\s*def\s+(\w+)"),
                ("class", r"^\s*class\s+(\w+)"),
                ("import", r#"^\s*require\s+['"]([^'"]+)['"]"#),
            ],
        },
        LanguageRules {
            extensions: &["sh", "bash"],
            patterns: vec![
                ("function", r"^\s*(?:function\s+)?(\w+)\s*\(\)\s*\{"),
                ("variable", r"^\s*(\w+)="),
            ],
        },
    ]
}

fn compiled_rules() -> &'static [(Vec<&'static str>, Vec<(&'static str, Regex)>)] {
    use std::sync::OnceLock;
    static RULES: OnceLock<Vec<(Vec<&'static str>, Vec<(&'static str, Regex)>)>> = OnceLock::new();
    RULES.get_or_init(|| {
        language_table()
            .into_iter()
            .map(|lang| {
                let compiled = lang
                    .patterns
                    .into_iter()
                    .filter_map(|(kind, pat)| Regex::new(pat).ok().map(|r| (kind, r)))
                    .collect();
                (lang.extensions.to_vec(), compiled)
            })
            .collect()
    })
}

fn rules_for_extension(ext: &str) -> Option<&'static [(&'static str, Regex)]> {
    compiled_rules()
        .iter()
        .find(|(exts, _)| exts.iter().any(|e| *e == ext))
        .map(|(_, rules)| rules.as_slice())
}

fn extract_symbols(content: &str, ext: &str) -> Vec<Symbol> {
    let Some(rules) = rules_for_extension(ext) else {
        return Vec::new();
    };
    let mut symbols = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        for (kind, re) in rules {
            if let Some(caps) = re.captures(line) {
                if let Some(m) = caps.get(1) {
                    symbols.push(Symbol {
                        name: m.as_str().trim().to_string(),
                        kind,
                        line: line_no + 1,
                        column: m.start() + 1,
                        context: line.trim().to_string(),
                    });
                }
            }
        }
    }
    symbols
}

fn is_excluded(path: &Path, excludes: &[String]) -> bool {
    path.components().any(|c| {
        let s = c.as_os_str().to_string_lossy();
        excludes.iter().any(|ex| ex == s.as_ref()) || (s.starts_with('.') && s.len() > 1 && s != "..")
    })
}

fn load_excludes(workspace_root: &Path) -> Vec<String> {
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    for ignore_file in [".gitignore", ".snowignore"] {
        if let Ok(content) = std::fs::read_to_string(workspace_root.join(ignore_file)) {
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    excludes.push(line.trim_end_matches('/').to_string());
                }
            }
        }
    }
    excludes
}

/// Per-workspace symbol index. Rebuilds are serialized through `building`.
pub struct CodeIndex {
    workspace_root: PathBuf,
    files: DashMap<PathBuf, FileSymbols>,
    last_build: Mutex<Option<SystemTime>>,
}

impl CodeIndex {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            files: DashMap::new(),
            last_build: Mutex::new(None),
        }
    }

    /// Builds or incrementally refreshes the index. Serialized by `last_build`'s
    /// mutex guard so concurrent callers await the in-flight build instead of
    /// racing it; a fresh-enough index (within `INDEX_TTL`) is reused as-is.
    async fn ensure_fresh(&self) {
        let mut guard = self.last_build.lock().await;
        if let Some(last) = *guard {
            if last.elapsed().unwrap_or(Duration::MAX) < INDEX_TTL {
                return;
            }
        }
        let excludes = load_excludes(&self.workspace_root);
        let root = self.workspace_root.clone();
        for entry in WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_excluded(e.path(), &excludes))
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_path_buf();
            let ext = match path.extension().and_then(|e| e.to_str()) {
                Some(e) => e.to_string(),
                None => continue,
            };
            if rules_for_extension(&ext).is_none() {
                continue;
            }
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if let Some(existing) = self.files.get(&path) {
                if existing.indexed_mtime >= mtime {
                    continue;
                }
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let symbols = extract_symbols(&content, &ext);
            self.files.insert(
                path,
                FileSymbols {
                    symbols,
                    indexed_mtime: mtime,
                },
            );
        }
        *guard = Some(SystemTime::now());
    }

    async fn fuzzy_search(&self, query: &str, kind: Option<&str>, limit: usize) -> Vec<(String, PathBuf, Symbol, i64)> {
        self.ensure_fresh().await;
        let query_lower = query.to_lowercase();
        let mut scored = Vec::new();
        for entry in self.files.iter() {
            let path = entry.key().clone();
            for sym in &entry.value().symbols {
                if let Some(k) = kind {
                    if sym.kind != k {
                        continue;
                    }
                }
                if let Some(score) = fuzzy_score(&query_lower, &sym.name.to_lowercase()) {
                    scored.push((sym.name.clone(), path.clone(), sym.clone(), score));
                }
            }
        }
        scored.sort_by(|a, b| b.3.cmp(&a.3));
        scored.truncate(limit);
        scored
    }

    async fn outline(&self, path: &Path) -> Vec<Symbol> {
        self.ensure_fresh().await;
        self.files
            .get(path)
            .map(|f| f.symbols.clone())
            .unwrap_or_default()
    }

    async fn find_references(&self, name: &str, limit: usize) -> Vec<Value> {
        self.ensure_fresh().await;
        let mut refs = Vec::new();
        for entry in self.files.iter() {
            for sym in &entry.value().symbols {
                if sym.name == name {
                    let classification = classify_reference(sym.kind, &sym.context, name);
                    refs.push(json!({
                        "file": entry.key().display().to_string(),
                        "line": sym.line,
                        "column": sym.column,
                        "classification": classification,
                        "context": sym.context,
                    }));
                    if refs.len() >= limit {
                        return refs;
                    }
                }
            }
        }
        refs
    }
}

fn classify_reference(kind: &str, context: &str, name: &str) -> &'static str {
    if kind == "import" {
        "import"
    } else if kind == "type" || kind == "interface" || kind == "class" {
        "definition"
    } else if context.trim_start().starts_with(&format!("fn {}", name))
        || context.contains(&format!("def {}", name))
        || context.contains(&format!("function {}", name))
    {
        "definition"
    } else {
        "usage"
    }
}

/// Subsequence-based fuzzy score: higher for contiguous, prefix, and
/// case-exact matches. Returns `None` if `query` is not a subsequence.
fn fuzzy_score(query: &str, candidate: &str) -> Option<i64> {
    if query.is_empty() {
        return Some(0);
    }
    if candidate == query {
        return Some(1_000);
    }
    if candidate.starts_with(query) {
        return Some(500 - candidate.len() as i64);
    }
    let mut score: i64 = 0;
    let mut cand_chars = candidate.char_indices().peekable();
    let mut last_match_idx: i64 = -2;
    for qc in query.chars() {
        let mut found = false;
        while let Some((idx, cc)) = cand_chars.next() {
            if cc == qc {
                if idx as i64 == last_match_idx + 1 {
                    score += 10; // contiguous run bonus
                } else {
                    score += 1;
                }
                last_match_idx = idx as i64;
                found = true;
                break;
            }
        }
        if !found {
            return None;
        }
    }
    score -= candidate.len() as i64 / 4; // prefer shorter/tighter candidates
    Some(score)
}

fn within_24h(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|m| m.elapsed().ok())
        .map(|e| e < Duration::from_secs(24 * 3600))
        .unwrap_or(false)
}

/// Multi-strategy text search: git grep, then ripgrep, then a pure walker.
/// Results are re-ranked so files modified within the last 24h sort first.
fn text_search(workspace_root: &Path, pattern: &str, glob: Option<&str>, case_insensitive: bool, max_results: usize) -> (Vec<String>, &'static str) {
    let excludes = load_excludes(workspace_root);

    if workspace_root.join(".git").is_dir() && command_exists("git") {
        let mut cmd = Command::new("git");
        cmd.arg("grep").arg("--untracked").arg("-n");
        if case_insensitive {
            cmd.arg("-i");
        }
        if let Some(g) = glob {
            cmd.arg("--").arg(format!(":(glob){}", g));
        }
        cmd.arg(pattern).current_dir(workspace_root);
        if let Ok(out) = cmd.output() {
            if out.status.success() || !out.stdout.is_empty() {
                let lines = rank_by_recency(workspace_root, parse_grep_lines(&out.stdout, max_results));
                return (lines, "git grep");
            }
        }
    }

    if command_exists("rg") {
        let mut cmd = Command::new("rg");
        cmd.arg("-n").arg("--no-heading");
        if case_insensitive {
            cmd.arg("-i");
        }
        if let Some(g) = glob {
            cmd.arg("-g").arg(g);
        }
        cmd.arg(pattern).current_dir(workspace_root);
        if let Ok(out) = cmd.output() {
            if out.status.success() {
                let lines = rank_by_recency(workspace_root, parse_grep_lines(&out.stdout, max_results));
                return (lines, "ripgrep");
            }
        }
    }

    // Pure in-process walker fallback.
    let re = match if case_insensitive {
        Regex::new(&format!("(?i){}", regex::escape(pattern)))
    } else {
        Regex::new(&regex::escape(pattern))
    } {
        Ok(r) => r,
        Err(_) => return (Vec::new(), "fallback"),
    };
    let file_glob = glob.and_then(|g| {
        globset::GlobBuilder::new(g)
            .literal_separator(false)
            .build()
            .ok()
            .map(|g| g.compile_matcher())
    });
    let mut results = Vec::new();
    for entry in WalkDir::new(workspace_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_excluded(e.path(), &excludes))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(ref g) = file_glob {
            if !g.is_match(entry.file_name().to_string_lossy().as_ref()) {
                continue;
            }
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (i, line) in content.lines().enumerate() {
            if re.is_match(line) {
                results.push(format!("{}:{}:{}", entry.path().display(), i + 1, line.trim()));
                if results.len() >= max_results {
                    break;
                }
            }
        }
        if results.len() >= max_results {
            break;
        }
    }
    (rank_by_recency(workspace_root, results), "fallback walker")
}

fn rank_by_recency(workspace_root: &Path, lines: Vec<String>) -> Vec<String> {
    let mut scored: Vec<(bool, usize, String)> = lines
        .into_iter()
        .enumerate()
        .map(|(i, l)| {
            let file_part = l.split(':').next().unwrap_or(&l);
            let p = if Path::new(file_part).is_absolute() {
                PathBuf::from(file_part)
            } else {
                workspace_root.join(file_part)
            };
            (within_24h(&p), i, l)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.into_iter().map(|(_, _, l)| l).collect()
}

fn parse_grep_lines(stdout: &[u8], max: usize) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .take(max)
        .map(|l| l.to_string())
        .collect()
}

fn command_exists(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub struct CodeSearchTool {
    workspace_root: PathBuf,
    index: Arc<CodeIndex>,
}

impl CodeSearchTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        let root = workspace_root.as_ref().to_path_buf();
        Self {
            index: Arc::new(CodeIndex::new(&root)),
            workspace_root: root,
        }
    }

    fn resolve(&self, p: &str) -> PathBuf {
        if Path::new(p).is_absolute() {
            PathBuf::from(p)
        } else {
            self.workspace_root.join(p)
        }
    }
}

#[async_trait::async_trait]
impl Tool for CodeSearchTool {
    fn name(&self) -> &str {
        "code_search"
    }

    fn description(&self) -> &str {
        "Search the workspace's code structure: fuzzy symbol search, text search \
         (git grep / ripgrep / fallback), reference finding, and file outlines."
    }

    fn prompt(&self) -> &str {
        "Use code_search for structural queries instead of grep when you want ranked \
         results: action=symbols (fuzzy name match), action=text (multi-strategy text \
         search), action=references (find usages of a symbol), action=outline (list \
         symbols in one file)."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["action"],
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["symbols", "text", "references", "outline"]
                },
                "query": { "type": "string", "description": "Symbol name, fuzzy query, or text pattern" },
                "kind": { "type": "string", "description": "Filter symbols by kind (function, class, type, ...)" },
                "path": { "type": "string", "description": "File path (required for outline)" },
                "glob": { "type": "string", "description": "Glob to scope a text search" },
                "case_insensitive": { "type": "boolean" },
                "limit": { "type": "integer", "description": "Max results (default 50)" }
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let action = match args["action"].as_str() {
            Some(a) => a,
            None => return ToolResult::error("Missing required parameter: action"),
        };
        let limit = args["limit"].as_u64().unwrap_or(50) as usize;

        match action {
            "symbols" => {
                let query = match args["query"].as_str() {
                    Some(q) => q,
                    None => return ToolResult::error("'query' is required for action=symbols"),
                };
                let kind = args["kind"].as_str();
                let results = self.index.fuzzy_search(query, kind, limit).await;
                if results.is_empty() {
                    return ToolResult::text("No matching symbols");
                }
                let out: Vec<Value> = results
                    .into_iter()
                    .map(|(name, path, sym, score)| {
                        json!({
                            "name": name,
                            "file": path.display().to_string(),
                            "kind": sym.kind,
                            "line": sym.line,
                            "score": score,
                        })
                    })
                    .collect();
                ToolResult::Json(json!(out))
            }
            "text" => {
                let query = match args["query"].as_str() {
                    Some(q) => q,
                    None => return ToolResult::error("'query' is required for action=text"),
                };
                let case_insensitive = args["case_insensitive"].as_bool().unwrap_or(false);
                let glob = args["glob"].as_str();
                let (lines, strategy) = text_search(&self.workspace_root, query, glob, case_insensitive, limit);
                debug!("code_search text via {}: {} results", strategy, lines.len());
                if lines.is_empty() {
                    ToolResult::text(format!("No matches ({})", strategy))
                } else {
                    ToolResult::text(format!("[{}]\n{}", strategy, lines.join("\n")))
                }
            }
            "references" => {
                let query = match args["query"].as_str() {
                    Some(q) => q,
                    None => return ToolResult::error("'query' is required for action=references"),
                };
                let refs = self.index.find_references(query, limit).await;
                if refs.is_empty() {
                    ToolResult::text("No references found")
                } else {
                    ToolResult::Json(json!(refs))
                }
            }
            "outline" => {
                let path = match args["path"].as_str() {
                    Some(p) => p,
                    None => return ToolResult::error("'path' is required for action=outline"),
                };
                let resolved = self.resolve(path);
                let symbols = self.index.outline(&resolved).await;
                if symbols.is_empty() {
                    ToolResult::text("No symbols found (unindexed, unrecognized language, or empty file)")
                } else {
                    ToolResult::Json(json!(symbols))
                }
            }
            other => ToolResult::error(format!("Unknown action: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuzzy_exact_beats_subsequence() {
        let exact = fuzzy_score("run", "run").unwrap();
        let sub = fuzzy_score("run", "run_turn_cancellable").unwrap();
        assert!(exact > sub);
    }

    #[test]
    fn fuzzy_rejects_non_subsequence() {
        assert!(fuzzy_score("xyz", "run_turn").is_none());
    }

    #[test]
    fn extracts_rust_function_symbol() {
        let symbols = extract_symbols("pub async fn run_turn(&self) {}", "rs");
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "run_turn");
        assert_eq!(symbols[0].kind, "function");
    }

    #[test]
    fn extracts_python_class_and_def() {
        let symbols = extract_symbols("class Foo:\n    def bar(self):\n        pass", "py");
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].kind, "class");
        assert_eq!(symbols[1].kind, "function");
    }

    #[test]
    fn classify_import_vs_definition() {
        assert_eq!(classify_reference("import", "use foo::bar", "bar"), "import");
        assert_eq!(classify_reference("function", "fn run_turn() {}", "run_turn"), "definition");
        assert_eq!(classify_reference("variable", "let run_turn = 1;", "run_turn"), "usage");
    }
}
