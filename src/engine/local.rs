//! Build context on the local filesystem.

use crate::core::resolver::ContextReader;
use std::io;
use std::path::{Path, PathBuf};

pub const PYTHON_VERSION_FILE: &str = ".python-version";
pub const IGNORE_FILE: &str = ".dockerignore";

/// A build context rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalContext {
    root: PathBuf,
}

impl LocalContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Exclude patterns from the ignore file. Missing file means none.
    pub fn ignore_patterns(&self) -> io::Result<Vec<String>> {
        let content = read_optional(&self.root.join(IGNORE_FILE))?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

impl ContextReader for LocalContext {
    fn pinned_python_version(&self) -> io::Result<String> {
        let content = read_optional(&self.root.join(PYTHON_VERSION_FILE))?;
        Ok(content.lines().next().unwrap_or_default().trim().to_string())
    }

    fn lock_file(&self, path: &str) -> io::Result<Vec<String>> {
        let full = self.root.join(path);
        let content = std::fs::read_to_string(&full)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", full.display(), e)))?;
        Ok(content.lines().map(str::to_string).collect())
    }
}

fn read_optional(path: &Path) -> io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}
