//! The shared, thread-safe, growing set of fuzz inputs, plus the shared
//! coverage map every worker's interpreter records branches into.
use std::path::Path;
use std::sync::{Arc, Mutex};

use walkdir::WalkDir;

use crate::coverage::CoverageMap;

/// Default cap on the number of inputs the corpus will hold.
pub const DEFAULT_MAX_INPUTS: usize = 1_000_000;

/// The shared corpus. Appends are serialized through a mutex; reads
/// (`get`/`len`) take the same mutex rather than relying on a lock-free
/// append-only arena — a deliberate simplicity trade-off, see DESIGN.md.
pub struct Corpus {
    inputs: Mutex<Vec<Arc<[u8]>>>,
    max_inputs: usize,
    coverage: Arc<CoverageMap>,
}

impl Corpus {
    /// Creates an empty corpus sharing the given coverage map.
    pub fn new(coverage: Arc<CoverageMap>, max_inputs: usize) -> Self {
        Self {
            inputs: Mutex::new(Vec::new()),
            max_inputs,
            coverage,
        }
    }

    /// Recursively walks `dir`, ingesting every regular file's contents
    /// verbatim as an input.
    pub fn load_dir(
        dir: impl AsRef<Path>,
        coverage: Arc<CoverageMap>,
        max_inputs: usize,
    ) -> std::io::Result<Self> {
        let corpus = Self::new(coverage, max_inputs);
        for entry in WalkDir::new(dir.as_ref()).into_iter() {
            let entry = entry.map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
            })?;
            if entry.file_type().is_file() {
                let data = std::fs::read(entry.path())?;
                if corpus.add(data.into()).is_err() {
                    tracing::warn!("corpus is full, skipping remaining files under {:?}", dir.as_ref());
                    break;
                }
            }
        }
        Ok(corpus)
    }

    /// Appends `input` to the corpus. Fails if the corpus is already at
    /// capacity.
    pub fn add(&self, input: Arc<[u8]>) -> Result<(), CorpusFullError> {
        let mut guard = self.inputs.lock().expect("corpus mutex poisoned");
        if guard.len() >= self.max_inputs {
            return Err(CorpusFullError);
        }
        guard.push(input);
        Ok(())
    }

    /// Number of inputs currently in the corpus.
    pub fn len(&self) -> usize {
        self.inputs.lock().expect("corpus mutex poisoned").len()
    }

    /// Whether the corpus currently holds no inputs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a clone of the `i`th input, or `None` if out of range.
    pub fn get(&self, i: usize) -> Option<Arc<[u8]>> {
        self.inputs
            .lock()
            .expect("corpus mutex poisoned")
            .get(i)
            .cloned()
    }

    /// The coverage map shared by every worker picking inputs from this corpus.
    pub fn coverage(&self) -> &Arc<CoverageMap> {
        &self.coverage
    }
}

/// Returned by [`Corpus::add`] when the corpus is already at its configured
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("corpus is full")]
pub struct CorpusFullError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_increases_len_and_tail_matches() {
        let corpus = Corpus::new(Arc::new(CoverageMap::new(16)), DEFAULT_MAX_INPUTS);
        corpus.add(Arc::from(&b"hello"[..])).unwrap();
        assert_eq!(corpus.len(), 1);
        assert_eq!(&*corpus.get(0).unwrap(), b"hello");

        corpus.add(Arc::from(&b"world"[..])).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(&*corpus.get(1).unwrap(), b"world");
    }

    #[test]
    fn add_past_capacity_fails() {
        let corpus = Corpus::new(Arc::new(CoverageMap::new(16)), 1);
        corpus.add(Arc::from(&b"a"[..])).unwrap();
        let err = corpus.add(Arc::from(&b"b"[..]));
        assert!(err.is_err());
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn load_dir_recurses_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.bin"), b"AAAA").unwrap();
        let sub = tmp.path().join("nested");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("b.bin"), b"BBBB").unwrap();

        let corpus =
            Corpus::load_dir(tmp.path(), Arc::new(CoverageMap::new(16)), DEFAULT_MAX_INPUTS)
                .unwrap();
        assert_eq!(corpus.len(), 2);
    }
}
