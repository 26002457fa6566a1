//! Lazy, memoized access to source text
//!
//! Report emission needs the raw text of every included line. Files are read
//! from disk at most once and split into lines that keep their trailing
//! newline, which is the form the report carries. A line number past the end
//! of the file yields an empty string rather than an error; a file that
//! cannot be read at all is fatal for the report that needs it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ProfileError, Result};

/// Read-only cache of source files split into lines
#[derive(Debug, Default)]
pub struct SourceCache {
    files: HashMap<PathBuf, Vec<String>>,
}

impl SourceCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// All lines of `path`, each retaining its trailing newline.
    ///
    /// Reads the file on first access; subsequent calls are served from the
    /// cache. An unreadable file is a fatal `SourceUnavailable` error.
    pub fn lines(&mut self, path: &Path) -> Result<&[String]> {
        if !self.files.contains_key(path) {
            let text = fs::read_to_string(path).map_err(|source| {
                ProfileError::SourceUnavailable {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            let lines = text.split_inclusive('\n').map(String::from).collect();
            self.files.insert(path.to_path_buf(), lines);
        }
        Ok(self.files[path].as_slice())
    }

    /// The text of 1-based line `lineno`, or `""` when out of range
    pub fn line(&mut self, path: &Path, lineno: u32) -> Result<&str> {
        let lines = self.lines(path)?;
        if lineno == 0 {
            return Ok("");
        }
        Ok(lines
            .get(lineno as usize - 1)
            .map(String::as_str)
            .unwrap_or(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fixture(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_lines_keep_trailing_newline() {
        let file = fixture("first\nsecond\n");
        let mut cache = SourceCache::new();
        let lines = cache.lines(file.path()).unwrap();
        assert_eq!(lines, ["first\n", "second\n"]);
    }

    #[test]
    fn test_line_is_one_based() {
        let file = fixture("a\nb\nc\n");
        let mut cache = SourceCache::new();
        assert_eq!(cache.line(file.path(), 1).unwrap(), "a\n");
        assert_eq!(cache.line(file.path(), 3).unwrap(), "c\n");
    }

    #[test]
    fn test_out_of_range_line_is_empty() {
        let file = fixture("only\n");
        let mut cache = SourceCache::new();
        assert_eq!(cache.line(file.path(), 0).unwrap(), "");
        assert_eq!(cache.line(file.path(), 42).unwrap(), "");
    }

    #[test]
    fn test_missing_file_is_source_unavailable() {
        let mut cache = SourceCache::new();
        let err = cache
            .lines(Path::new("/nonexistent/profiled.py"))
            .unwrap_err();
        assert!(matches!(err, ProfileError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_file_without_final_newline() {
        let file = fixture("x = 1\ny = 2");
        let mut cache = SourceCache::new();
        assert_eq!(cache.line(file.path(), 2).unwrap(), "y = 2");
    }
}
