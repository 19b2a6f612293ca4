//! Live codebase lookups for exported symbols.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Answers whether a symbol is defined somewhere in the codebase right now.
pub trait SymbolLocator: Send + Sync {
    fn locate(&self, symbol: &str) -> bool;
}

const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", ".waveforge", "dist", "vendor"];
const MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Walks the project tree and greps for symbol definitions.
#[derive(Debug, Clone)]
pub struct FsSymbolLocator {
    root: PathBuf,
}

impl FsSymbolLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Definition pattern for the last segment of a (possibly qualified) symbol.
    fn pattern(symbol: &str) -> Option<Regex> {
        let name = symbol
            .rsplit(|c| c == ':' || c == '.')
            .find(|s| !s.is_empty())?
            .trim();
        if name.is_empty() {
            return None;
        }
        let pattern = format!(
            r"\b(fn|struct|enum|trait|type|const|static|mod|union|class|def|function|interface|let|var)\s+{}\b",
            regex::escape(name)
        );
        Regex::new(&pattern).ok()
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIP_DIRS.contains(&name))
}

impl SymbolLocator for FsSymbolLocator {
    fn locate(&self, symbol: &str) -> bool {
        let Some(re) = Self::pattern(symbol) else {
            return false;
        };

        let walker = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e));

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map_or(true, |m| m.len() > MAX_FILE_BYTES) {
                continue;
            }
            // Binary and non-UTF-8 files are skipped.
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            if re.is_match(&content) {
                debug!(symbol, file = %entry.path().display(), "Located symbol");
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_locates_rust_definitions() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/auth.rs"),
            "pub struct Session;\npub fn login() {}\n",
        )
        .unwrap();

        let locator = FsSymbolLocator::new(dir.path());
        assert!(locator.locate("login"));
        assert!(locator.locate("auth::Session"));
        assert!(!locator.locate("logout"));
    }

    #[test]
    fn test_word_boundary_prevents_prefix_matches() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("lib.rs"), "fn login_user() {}\n").unwrap();

        let locator = FsSymbolLocator::new(dir.path());
        assert!(!locator.locate("login"));
        assert!(locator.locate("login_user"));
    }

    #[test]
    fn test_skips_build_and_vcs_directories() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::write(dir.path().join("target/debug/gen.rs"), "fn hidden() {}\n").unwrap();

        let locator = FsSymbolLocator::new(dir.path());
        assert!(!locator.locate("hidden"));
    }

    #[test]
    fn test_empty_symbol_is_never_found() {
        let dir = tempdir().unwrap();
        let locator = FsSymbolLocator::new(dir.path());
        assert!(!locator.locate(""));
        assert!(!locator.locate("::"));
    }
}
