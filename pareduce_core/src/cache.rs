use crate::oracle::Classification;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Defines errors that can arise while reading or writing the result cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Only terminal non-interesting verdicts are persisted.
    #[error("classification {0:?} is never cached")]
    NotCacheable(Classification),

    /// An I/O error on a cache path.
    #[error("cache I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Persistent, marker-file store of terminal non-interesting classifications.
///
/// The layout under `root` is:
/// * `ir/`: compiled IR variants, owned by the compiler stage.
/// * `results/<key>.uninteresting` and `results/<key>.nocompile`: zero-byte markers.
///
/// Keys come from [`crate::compiler::CompileVariant::key`], which already folds a
/// content digest in, so a marker can never be mistaken for one belonging to an
/// edited program. There is no locking; concurrent workers may both compute and
/// store the same verdict, and storing is idempotent.
#[derive(Debug, Clone)]
pub struct ResultCache {
    root: PathBuf,
}

impl ResultCache {
    const IR_DIR: &'static str = "ir";
    const RESULTS_DIR: &'static str = "results";

    /// Opens the cache at `root`, creating its directories if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache = Self { root: root.into() };
        for dir in [cache.ir_dir(), cache.results_dir()] {
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }
        Ok(cache)
    }

    /// Directory holding compiled IR variants.
    pub fn ir_dir(&self) -> PathBuf {
        self.root.join(Self::IR_DIR)
    }

    fn results_dir(&self) -> PathBuf {
        self.root.join(Self::RESULTS_DIR)
    }

    /// Marker path for `classification`, or `None` for `Interesting`.
    pub fn marker_path(&self, key: &str, classification: Classification) -> Option<PathBuf> {
        let suffix = match classification {
            Classification::Uninteresting => "uninteresting",
            Classification::Uncompilable => "nocompile",
            Classification::Interesting => return None,
        };
        Some(self.results_dir().join(format!("{key}.{suffix}")))
    }

    /// Returns the cached verdict for `key`, checking the uninteresting
    /// marker before the uncompilable one.
    pub fn lookup(&self, key: &str) -> Option<Classification> {
        [Classification::Uninteresting, Classification::Uncompilable]
            .into_iter()
            .find(|&c| self.marker_path(key, c).is_some_and(|p| p.exists()))
    }

    /// Records a terminal non-interesting verdict, removing the opposite
    /// marker so that at most one exists per key.
    pub fn store(&self, key: &str, classification: Classification) -> Result<(), CacheError> {
        let (marker, opposite) = match classification {
            Classification::Uninteresting => (classification, Classification::Uncompilable),
            Classification::Uncompilable => (classification, Classification::Uninteresting),
            Classification::Interesting => {
                return Err(CacheError::NotCacheable(classification));
            }
        };
        if let Some(path) = self.marker_path(key, marker) {
            touch(&path)?;
        }
        if let Some(path) = self.marker_path(key, opposite) {
            remove_if_exists(&path)?;
        }
        debug!("Cached {key} as {classification}");
        Ok(())
    }

    /// Deletes the whole cache tree, compiled variants included.
    pub fn reset(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&self.root)(e)),
        }
    }
}

fn touch(path: &Path) -> Result<(), CacheError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(drop)
        .map_err(io_err(path))
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_layout() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        let cache = ResultCache::open(&root).unwrap();
        assert!(cache.ir_dir().is_dir());
        assert!(root.join("results").is_dir());
    }

    #[test]
    fn lookup_misses_on_fresh_cache() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        assert_eq!(cache.lookup("prog.-O0.abc"), None);
    }

    #[test]
    fn store_then_lookup() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        cache
            .store("a.-O0.1", Classification::Uninteresting)
            .unwrap();
        cache.store("b.-O2.2", Classification::Uncompilable).unwrap();
        assert_eq!(cache.lookup("a.-O0.1"), Some(Classification::Uninteresting));
        assert_eq!(cache.lookup("b.-O2.2"), Some(Classification::Uncompilable));
        let marker = cache
            .marker_path("a.-O0.1", Classification::Uninteresting)
            .unwrap();
        assert_eq!(fs::metadata(marker).unwrap().len(), 0);
    }

    #[test]
    fn markers_are_mutually_exclusive() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let key = "prog.-O0.feed";
        cache.store(key, Classification::Uncompilable).unwrap();
        cache.store(key, Classification::Uninteresting).unwrap();
        let nocompile = cache
            .marker_path(key, Classification::Uncompilable)
            .unwrap();
        let uninteresting = cache
            .marker_path(key, Classification::Uninteresting)
            .unwrap();
        assert!(uninteresting.exists());
        assert!(!nocompile.exists());

        cache.store(key, Classification::Uncompilable).unwrap();
        assert!(nocompile.exists());
        assert!(!uninteresting.exists());
        assert_eq!(cache.lookup(key), Some(Classification::Uncompilable));
    }

    #[test]
    fn store_is_idempotent() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        for _ in 0..3 {
            cache.store("k", Classification::Uninteresting).unwrap();
        }
        assert_eq!(cache.lookup("k"), Some(Classification::Uninteresting));
    }

    #[test]
    fn interesting_is_never_cached() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let err = cache.store("k", Classification::Interesting).unwrap_err();
        assert!(matches!(
            err,
            CacheError::NotCacheable(Classification::Interesting)
        ));
        assert_eq!(cache.lookup("k"), None);
        assert!(cache.marker_path("k", Classification::Interesting).is_none());
    }

    #[test]
    fn reset_removes_everything() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        let cache = ResultCache::open(&root).unwrap();
        cache.store("k", Classification::Uninteresting).unwrap();
        fs::write(cache.ir_dir().join("k.bc"), b"BC").unwrap();
        cache.reset().unwrap();
        assert!(!root.exists());
        // Resetting an absent cache is not an error.
        cache.reset().unwrap();
        let reopened = ResultCache::open(&root).unwrap();
        assert_eq!(reopened.lookup("k"), None);
    }
}
