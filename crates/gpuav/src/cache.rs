//! Instrumented shader cache.
//!
//! Keyed by `(source hash, check set, layout fingerprint)`. Each key owns a `OnceLock`
//! cell, so two pipelines racing on the same shader run one instrumentation pass between
//! them while builds for unrelated keys proceed in parallel. The map lock only guards
//! cell lookup and is never held while a build runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::trace;

use crate::config::CheckSet;
use crate::instrument::InstrumentedShaderRecord;
use crate::layout::LayoutFingerprint;
use crate::shader::SourceId;
use crate::stats::GpuAvStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: SourceId,
    pub checks: u32,
    pub layout: LayoutFingerprint,
}

impl CacheKey {
    pub fn new(source: SourceId, checks: CheckSet, layout: LayoutFingerprint) -> Self {
        Self {
            source,
            checks: checks.bits(),
            layout,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub evictions: u64,
    pub entries: usize,
}

type Cell = Arc<OnceLock<Arc<InstrumentedShaderRecord>>>;

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<CacheKey, Cell>,
    hits: u64,
    misses: u64,
    builds: u64,
    evictions: u64,
}

#[derive(Debug)]
pub struct ShaderCache {
    inner: Mutex<Inner>,
    stats: Arc<GpuAvStats>,
}

impl ShaderCache {
    pub fn new(stats: Arc<GpuAvStats>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            stats,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<InstrumentedShaderRecord>> {
        self.lock().entries.get(key).and_then(|c| c.get().cloned())
    }

    /// Returns the record for `key`, running `build` if no record exists yet.
    ///
    /// Concurrent callers for the same key block until the single build finishes and then
    /// share its result.
    pub fn get_or_build(
        &self,
        key: CacheKey,
        build: impl FnOnce() -> InstrumentedShaderRecord,
    ) -> Arc<InstrumentedShaderRecord> {
        let cell = {
            let mut inner = self.lock();
            match inner.entries.get(&key).cloned() {
                Some(cell) => {
                    inner.hits += 1;
                    self.stats.inc_cache_hits();
                    cell
                }
                None => {
                    inner.misses += 1;
                    self.stats.inc_cache_misses();
                    let cell = Cell::default();
                    inner.entries.insert(key, cell.clone());
                    cell
                }
            }
        };

        let mut built = false;
        let record = cell
            .get_or_init(|| {
                built = true;
                Arc::new(build())
            })
            .clone();
        if built {
            self.lock().builds += 1;
            self.stats.inc_cache_builds();
            trace!(source = %key.source, checks = key.checks, "built instrumented shader");
        }
        record
    }

    /// Drops every entry derived from `source`. Records in use elsewhere stay alive.
    pub fn evict_source(&self, source: SourceId) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|k, _| k.source != source);
        let evicted = before - inner.entries.len();
        inner.evictions += evicted as u64;
        self.stats.add_cache_evictions(evicted as u64);
        evicted
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        let evicted = inner.entries.len() as u64;
        inner.entries.clear();
        inner.evictions += evicted;
        self.stats.add_cache_evictions(evicted);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            builds: inner.builds,
            evictions: inner.evictions,
            entries: inner.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{InstrumentOptions, SkipReason};
    use crate::shader::ShaderImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn record(words: &[u32]) -> InstrumentedShaderRecord {
        InstrumentedShaderRecord::skipped(
            &ShaderImage::new(words, None),
            SkipReason::Filtered,
            LayoutFingerprint::NONE,
            &InstrumentOptions {
                checks: CheckSet::all(),
                safe_mode: true,
                max_shader_words: 0,
                shader_id: 1,
            },
        )
    }

    fn key(words: &[u32], checks: CheckSet) -> CacheKey {
        CacheKey::new(SourceId::of_words(words), checks, LayoutFingerprint::NONE)
    }

    #[test]
    fn second_lookup_hits() {
        let cache = ShaderCache::new(Arc::default());
        let a = cache.get_or_build(key(&[1], CheckSet::all()), || record(&[1]));
        let b = cache.get_or_build(key(&[1], CheckSet::all()), || panic!("rebuilt"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                builds: 1,
                evictions: 0,
                entries: 1,
            }
        );
    }

    #[test]
    fn check_set_is_part_of_the_key() {
        let cache = ShaderCache::new(Arc::default());
        cache.get_or_build(key(&[1], CheckSet::all()), || record(&[1]));
        cache.get_or_build(key(&[1], CheckSet::BUFFER_OOB), || record(&[1]));
        assert_eq!(cache.stats().builds, 2);
    }

    #[test]
    fn concurrent_builds_of_one_key_run_once() {
        let cache = Arc::new(ShaderCache::new(Arc::default()));
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (cache, builds, barrier) = (cache.clone(), builds.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_build(key(&[7], CheckSet::all()), || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        record(&[7])
                    })
                })
            })
            .collect();
        let records: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(records.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.stats().builds, 1);
    }

    #[test]
    fn unrelated_keys_build_in_parallel() {
        let cache = Arc::new(ShaderCache::new(Arc::default()));
        // Both builders must be inside `build` at the same time to get past the barrier.
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [1u32, 2]
            .into_iter()
            .map(|w| {
                let (cache, barrier) = (cache.clone(), barrier.clone());
                thread::spawn(move || {
                    cache.get_or_build(key(&[w], CheckSet::all()), || {
                        barrier.wait();
                        record(&[w])
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn eviction_keeps_live_records() {
        let cache = ShaderCache::new(Arc::default());
        let live = cache.get_or_build(key(&[3], CheckSet::all()), || record(&[3]));
        cache.get_or_build(key(&[3], CheckSet::BUFFER_OOB), || record(&[3]));
        cache.get_or_build(key(&[4], CheckSet::all()), || record(&[4]));
        assert_eq!(cache.evict_source(SourceId::of_words(&[3])), 2);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(&live.words[..], &[3]);
        cache.clear();
        assert_eq!(cache.stats().evictions, 3);
        assert!(cache.get(&key(&[4], CheckSet::all())).is_none());
    }
}
