//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the tests under `tests/`:
//! - No sleep() calls in production transport or demo code
//! - Callback ids are allocated only by the transport primitives
//!
//! Scanning is line based. Comment text and everything from a file's
//! `#[cfg(test)]` module onward are treated as non-production and skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["bridge/core/src", "bridge/demo/src"];

/// A single offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File path relative to the workspace root
    pub file: String,
    /// 1-based line number
    pub line: usize,
    /// The trimmed source line
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.file, self.line, self.text)
    }
}

/// Workspace root, resolved from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// All `.rs` files under `dir` (relative to the workspace root)
#[must_use]
pub fn rust_sources(dir: &str) -> Vec<PathBuf> {
    let path = workspace_root().join(dir);
    if !path.exists() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();
    files
}

/// Production lines of `content` as `(line_number, code)` pairs.
///
/// Line comments are stripped, doc and block-comment lines are dropped,
/// and scanning stops at the first `#[cfg(test)]`.
#[must_use]
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    let mut lines = Vec::new();
    let mut in_block_comment = false;

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();

        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if in_block_comment {
            if trimmed.contains("*/") {
                in_block_comment = false;
            }
            continue;
        }
        if trimmed.starts_with("/*") {
            in_block_comment = !trimmed.contains("*/");
            continue;
        }

        let code = line.split("//").next().unwrap_or(line);
        if !code.trim().is_empty() {
            lines.push((idx + 1, code));
        }
    }

    lines
}

/// Scan every production file under `dirs` for lines matching `offends`
pub fn scan<F>(dirs: &[&str], mut offends: F) -> Vec<Violation>
where
    F: FnMut(&Path, &str) -> bool,
{
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in dirs {
        for path in rust_sources(dir) {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let relative = path
                .strip_prefix(&root)
                .unwrap_or(&path)
                .display()
                .to_string();

            for (line, code) in production_lines(&content) {
                if offends(&path, code) {
                    violations.push(Violation {
                        file: relative.clone(),
                        line,
                        text: code.trim().to_string(),
                    });
                }
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_strip_comments() {
        let source = "fn a() {\n    // thread::sleep(x);\n    let y = 1; // .sleep(\n}\n";
        let lines = production_lines(source);

        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|(_, code)| !code.contains("sleep")));
    }

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() { std::thread::sleep(d); }\n}\n";
        let lines = production_lines(source);

        assert_eq!(lines, vec![(1, "fn a() {}")]);
    }

    #[test]
    fn test_production_lines_skip_block_comments() {
        let source = "/*\n tokio::time::sleep(d)\n*/\nfn a() {}\n";
        let lines = production_lines(source);

        assert_eq!(lines, vec![(4, "fn a() {}")]);
    }

    #[test]
    fn test_production_dirs_exist() {
        for dir in PRODUCTION_DIRS {
            assert!(
                !rust_sources(dir).is_empty(),
                "expected Rust sources under {dir}"
            );
        }
    }
}
