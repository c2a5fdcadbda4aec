/// Cache counters
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    invalidations: AtomicU64,
    source_lookups: AtomicU64,
    writebacks: AtomicU64,
    writebacks_dropped: AtomicU64,
    validate_count: AtomicU64,
    validate_micros: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub invalidations: u64,
    pub source_lookups: u64,
    pub writebacks: u64,
    pub writebacks_dropped: u64,
    pub avg_validate_micros: u64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A cache-layer error; reads that fail are also counted as misses
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self, keys: u64) {
        self.invalidations.fetch_add(keys, Ordering::Relaxed);
    }

    pub fn record_source_lookup(&self) {
        self.source_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_writeback(&self) {
        self.writebacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_writeback_dropped(&self) {
        self.writebacks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validate_latency(&self, elapsed: Duration) {
        self.validate_count.fetch_add(1, Ordering::Relaxed);
        self.validate_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let validations = self.validate_count.load(Ordering::Relaxed);

        MetricsSnapshot {
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            invalidations: self.invalidations.load(Ordering::Relaxed),
            source_lookups: self.source_lookups.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            writebacks_dropped: self.writebacks_dropped.load(Ordering::Relaxed),
            avg_validate_micros: self
                .validate_micros
                .load(Ordering::Relaxed)
                .checked_div(validations)
                .unwrap_or(0),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.errors,
            &self.invalidations,
            &self.source_lookups,
            &self.writebacks,
            &self.writebacks_dropped,
            &self.validate_count,
            &self.validate_micros,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.snapshot().hit_rate, 0.0);

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        assert_eq!(metrics.snapshot().hit_rate, 0.75);
    }

    #[test]
    fn test_average_latency_and_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_validate_latency(Duration::from_micros(100));
        metrics.record_validate_latency(Duration::from_micros(300));
        assert_eq!(metrics.snapshot().avg_validate_micros, 200);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.avg_validate_micros, 0);
        assert_eq!(snapshot.hits, 0);
    }

    #[test]
    fn test_snapshot_field_names() {
        let metrics = CacheMetrics::new();
        metrics.record_miss();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["misses"], 1);
        assert!(json.get("hitRate").is_some());
    }
}
