//! Compiled-program cache.
//!
//! Compiling a stylesheet means parsing it, resolving its inclusions and
//! compiling every path expression in it. A site typically has a handful of
//! programs and hundreds of source files, so programs are compiled once per
//! process and shared by every rule and every worker thread.
//!
//! Keys are the canonicalized program path, so `xsl/page.xsl` and
//! `./xsl/../xsl/page.xsl` share an entry. Entries are never evicted: a
//! [`TransformCache`] lives as long as the [`Site`](crate::site::Site) that
//! owns it.
//!
//! Lookups take the lock only to clone an `Arc`; compilation happens outside
//! the lock, and the insert re-checks the map so two workers racing on the
//! same key keep a single program.

use super::{Program, TransformEngine, TransformError};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub struct TransformCache {
    engine: Box<dyn TransformEngine>,
    programs: Mutex<HashMap<PathBuf, Arc<dyn Program>>>,
    stats: Mutex<CacheStats>,
}

impl TransformCache {
    pub fn new(engine: Box<dyn TransformEngine>) -> Self {
        Self {
            engine,
            programs: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Return the compiled program for `path`, compiling it on first use.
    pub fn get(&self, path: &Path) -> Result<Arc<dyn Program>, TransformError> {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        if let Some(program) = self.lock_programs().get(&key) {
            self.lock_stats().reuse();
            return Ok(Arc::clone(program));
        }

        let compiled: Arc<dyn Program> = Arc::from(self.engine.compile(path)?);
        let mut programs = self.lock_programs();
        match programs.get(&key) {
            Some(existing) => {
                self.lock_stats().reuse();
                Ok(Arc::clone(existing))
            }
            None => {
                tracing::debug!(program = %path.display(), "compiled transform program");
                programs.insert(key, Arc::clone(&compiled));
                self.lock_stats().compile();
                Ok(compiled)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock_programs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        *self.lock_stats()
    }

    // A poisoned lock only means another worker panicked mid-insert; the map
    // itself is still consistent.
    fn lock_programs(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<dyn Program>>> {
        self.programs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, CacheStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Summary of cache use for a build run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub compiled: u32,
    pub reused: u32,
}

impl CacheStats {
    pub fn compile(&mut self) {
        self.compiled += 1;
    }

    pub fn reuse(&mut self) {
        self.reused += 1;
    }

    pub fn total(&self) -> u32 {
        self.compiled + self.reused
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reused > 0 {
            write!(
                f,
                "{} compiled, {} reused ({} lookups)",
                self.compiled,
                self.reused,
                self.total()
            )
        } else {
            write!(f, "{} compiled", self.compiled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::tests::{MockEngine, RecordedOp};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn cache_with_mock() -> (TransformCache, Arc<Mutex<Vec<RecordedOp>>>) {
        let engine = MockEngine::new();
        let ops = Arc::clone(&engine.operations);
        (TransformCache::new(Box::new(engine)), ops)
    }

    fn compiles(ops: &Mutex<Vec<RecordedOp>>) -> usize {
        ops.lock()
            .unwrap()
            .iter()
            .filter(|op| matches!(op, RecordedOp::Compile(_)))
            .count()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    #[test]
    fn compiles_once_per_path() {
        let tmp = TempDir::new().unwrap();
        let xsl = tmp.path().join("page.xsl");
        fs::write(&xsl, "<x/>").unwrap();
        let (cache, ops) = cache_with_mock();

        cache.get(&xsl).unwrap();
        cache.get(&xsl).unwrap();
        cache.get(&xsl).unwrap();

        assert_eq!(compiles(&ops), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                compiled: 1,
                reused: 2
            }
        );
    }

    #[test]
    fn equivalent_paths_share_an_entry() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("xsl")).unwrap();
        let xsl = tmp.path().join("xsl/page.xsl");
        fs::write(&xsl, "<x/>").unwrap();
        let (cache, ops) = cache_with_mock();

        cache.get(&xsl).unwrap();
        cache.get(&tmp.path().join("xsl/../xsl/page.xsl")).unwrap();

        assert_eq!(compiles(&ops), 1);
    }

    #[test]
    fn distinct_programs_get_distinct_entries() {
        let tmp = TempDir::new().unwrap();
        for name in ["a.xsl", "b.xsl"] {
            fs::write(tmp.path().join(name), "<x/>").unwrap();
        }
        let (cache, ops) = cache_with_mock();

        cache.get(&tmp.path().join("a.xsl")).unwrap();
        cache.get(&tmp.path().join("b.xsl")).unwrap();

        assert_eq!(compiles(&ops), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn shared_across_threads() {
        use rayon::prelude::*;

        let tmp = TempDir::new().unwrap();
        let xsl = tmp.path().join("page.xsl");
        fs::write(&xsl, "<x/>").unwrap();
        let (cache, _ops) = cache_with_mock();

        (0..32).into_par_iter().for_each(|_| {
            cache.get(&xsl).unwrap();
        });

        // Racing compiles may happen, but only one program is kept.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().total(), 32);
        assert_eq!(cache.stats().compiled, 1);
    }

    // =========================================================================
    // CacheStats
    // =========================================================================

    #[test]
    fn cache_stats_display_with_reuse() {
        let s = CacheStats {
            compiled: 2,
            reused: 5,
        };
        assert_eq!(format!("{}", s), "2 compiled, 5 reused (7 lookups)");
    }

    #[test]
    fn cache_stats_display_no_reuse() {
        let s = CacheStats {
            compiled: 3,
            reused: 0,
        };
        assert_eq!(format!("{}", s), "3 compiled");
    }
}
