use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Telemetry counters for the engine.
///
/// Cheap to bump from any recording thread; read them with [`GpuAvStats::snapshot`].
#[derive(Debug, Default)]
pub struct GpuAvStats {
    shaders_instrumented: AtomicU64,
    shaders_passed_through: AtomicU64,
    shaders_skipped: AtomicU64,

    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_builds: AtomicU64,
    cache_evictions: AtomicU64,

    layouts_augmented: AtomicU64,
    layouts_degraded: AtomicU64,

    submissions_harvested: AtomicU64,
    submissions_abandoned: AtomicU64,
    submissions_lost: AtomicU64,
    /// Draws and dispatches forwarded without a reserved set after an internal failure.
    draws_unchecked: AtomicU64,

    records_decoded: AtomicU64,
    records_malformed: AtomicU64,
    records_dropped: AtomicU64,
}

macro_rules! counters {
    ($($inc:ident / $add:ident => $field:ident),* $(,)?) => {
        impl GpuAvStats {
            $(
                pub fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }

                pub fn $add(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> GpuAvStatsSnapshot {
                GpuAvStatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }

        /// Point-in-time copy of [`GpuAvStats`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct GpuAvStatsSnapshot {
            $(pub $field: u64,)*
        }
    };
}

counters! {
    inc_shaders_instrumented / add_shaders_instrumented => shaders_instrumented,
    inc_shaders_passed_through / add_shaders_passed_through => shaders_passed_through,
    inc_shaders_skipped / add_shaders_skipped => shaders_skipped,
    inc_cache_hits / add_cache_hits => cache_hits,
    inc_cache_misses / add_cache_misses => cache_misses,
    inc_cache_builds / add_cache_builds => cache_builds,
    inc_cache_evictions / add_cache_evictions => cache_evictions,
    inc_layouts_augmented / add_layouts_augmented => layouts_augmented,
    inc_layouts_degraded / add_layouts_degraded => layouts_degraded,
    inc_submissions_harvested / add_submissions_harvested => submissions_harvested,
    inc_submissions_abandoned / add_submissions_abandoned => submissions_abandoned,
    inc_submissions_lost / add_submissions_lost => submissions_lost,
    inc_draws_unchecked / add_draws_unchecked => draws_unchecked,
    inc_records_decoded / add_records_decoded => records_decoded,
    inc_records_malformed / add_records_malformed => records_malformed,
    inc_records_dropped / add_records_dropped => records_dropped,
}

impl GpuAvStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

impl GpuAvStatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
