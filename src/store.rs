//! Persistence of accepted parsers.
//!
//! One file per target, `{parsers_dir}/{target}_parser.py`, written
//! atomically (temp file + rename) so a crash never leaves a half-written
//! parser where the next run would pick it up.

use crate::error::ParseGenError;
use crate::pipeline::code::{CandidateOrigin, CandidateParser};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ParserStore {
    dir: PathBuf,
}

impl ParserStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the parser for `target` lives.
    pub fn path_for(&self, target: &str) -> PathBuf {
        self.dir.join(format!("{target}_parser.py"))
    }

    /// Write an accepted parser, replacing any previous one.
    pub async fn save(&self, target: &str, candidate: &CandidateParser) -> Result<PathBuf, ParseGenError> {
        let path = self.path_for(target);
        let write_err = |e| ParseGenError::OutputWriteFailed {
            path: path.clone(),
            source: e,
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(write_err)?;

        let tmp_path = path.with_extension("py.tmp");
        tokio::fs::write(&tmp_path, &candidate.source)
            .await
            .map_err(write_err)?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(write_err)?;

        info!("Parser written to {}", path.display());
        Ok(path)
    }

    /// Load the persisted parser for `target`.
    ///
    /// `Ok(None)` when there is none, when the file is not valid UTF-8, or
    /// when it no longer defines the entry point (it will be regenerated).
    pub async fn load(&self, target: &str) -> Result<Option<CandidateParser>, ParseGenError> {
        let path = self.path_for(target);
        let source = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No persisted parser at {}", path.display());
                return Ok(None);
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!("Ignoring persisted parser {}: not valid UTF-8", path.display());
                return Ok(None);
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ParseGenError::PermissionDenied { path });
            }
            Err(e) => {
                return Err(ParseGenError::Internal(format!(
                    "reading '{}': {e}",
                    path.display()
                )))
            }
        };

        match CandidateParser::new(source, CandidateOrigin::Persisted) {
            Ok(candidate) => Ok(Some(candidate)),
            Err(e) => {
                warn!("Ignoring persisted parser {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(body: &str) -> CandidateParser {
        CandidateParser::new(format!("def parse(p):\n    {body}\n"), CandidateOrigin::Synthesized)
            .unwrap()
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParserStore::new(dir.path().join("custom_parsers"));
        let path = store.save("icici", &candidate("return []")).await.unwrap();
        assert_eq!(path, dir.path().join("custom_parsers/icici_parser.py"));
        assert!(!path.with_extension("py.tmp").exists());

        let loaded = store.load("icici").await.unwrap().unwrap();
        assert_eq!(loaded.origin, CandidateOrigin::Persisted);
        assert!(loaded.source.contains("return []"));
    }

    #[tokio::test]
    async fn save_replaces_previous_parser() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParserStore::new(dir.path());
        store.save("sbi", &candidate("return 1")).await.unwrap();
        store.save("sbi", &candidate("return 2")).await.unwrap();
        let loaded = store.load("sbi").await.unwrap().unwrap();
        assert!(loaded.source.contains("return 2"));
    }

    #[tokio::test]
    async fn missing_parser_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParserStore::new(dir.path());
        assert!(store.load("hdfc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn parser_without_entry_point_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParserStore::new(dir.path());
        std::fs::write(store.path_for("axis"), "print('hi')\n").unwrap();
        assert!(store.load("axis").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_utf8_parser_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParserStore::new(dir.path());
        std::fs::write(store.path_for("kotak"), b"def parse(p):\n    return '\xff\xfe'\n").unwrap();
        assert!(store.load("kotak").await.unwrap().is_none());
    }
}
