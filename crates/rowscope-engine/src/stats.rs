//! Per-data-source cache hit statistics.
//!
//! Hits and misses are counted in one-minute buckets over a sliding window.
//! The health scorer reads the windowed hit rate; nothing on the read path
//! depends on it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rowscope_core::DataSourceId;
use time::OffsetDateTime;

/// Default window length in minutes.
pub const DEFAULT_WINDOW_MINUTES: u32 = 15;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    minute: i64,
    hits: u64,
    misses: u64,
}

/// Sliding window of one-minute hit/miss buckets.
#[derive(Debug, Clone)]
pub struct HitRateWindow {
    minutes: u32,
    buckets: VecDeque<Bucket>,
}

impl HitRateWindow {
    pub fn new(minutes: u32) -> Self {
        let minutes = minutes.max(1);
        Self {
            minutes,
            buckets: VecDeque::with_capacity(minutes as usize),
        }
    }

    /// Count one read. A clock that steps backwards is clamped to the newest
    /// bucket so buckets stay ordered by minute.
    pub fn record(&mut self, hit: bool, now: OffsetDateTime) {
        let observed = now.unix_timestamp().div_euclid(60);
        let minute = self
            .buckets
            .back()
            .map_or(observed, |newest| newest.minute.max(observed));
        self.evict(minute);
        match self.buckets.back_mut() {
            Some(bucket) if bucket.minute == minute => bucket.bump(hit),
            _ => {
                let mut bucket = Bucket {
                    minute,
                    ..Bucket::default()
                };
                bucket.bump(hit);
                self.buckets.push_back(bucket);
            }
        }
    }

    /// `(hits, misses)` inside the window ending at `now`.
    pub fn totals(&self, now: OffsetDateTime) -> (u64, u64) {
        let oldest = self.oldest_minute(now.unix_timestamp().div_euclid(60));
        self.buckets
            .iter()
            .filter(|b| b.minute >= oldest)
            .fold((0, 0), |(h, m), b| (h + b.hits, m + b.misses))
    }

    /// Hit ratio in `[0, 1]`, or `None` without traffic in the window.
    pub fn hit_rate(&self, now: OffsetDateTime) -> Option<f64> {
        let (hits, misses) = self.totals(now);
        let total = hits + misses;
        (total > 0).then(|| hits as f64 / total as f64)
    }

    fn oldest_minute(&self, current: i64) -> i64 {
        current - i64::from(self.minutes) + 1
    }

    fn evict(&mut self, current: i64) {
        let oldest = self.oldest_minute(current);
        while self.buckets.front().is_some_and(|b| b.minute < oldest) {
            self.buckets.pop_front();
        }
    }
}

impl Bucket {
    fn bump(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }
}

/// Hit statistics for every data source.
#[derive(Debug)]
pub struct CacheStats {
    window_minutes: u32,
    windows: DashMap<DataSourceId, HitRateWindow>,
    slow_path_reads: AtomicU64,
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MINUTES)
    }
}

impl CacheStats {
    pub fn new(window_minutes: u32) -> Self {
        Self {
            window_minutes,
            windows: DashMap::new(),
            slow_path_reads: AtomicU64::new(0),
        }
    }

    pub fn record_hit(&self, ds: &DataSourceId) {
        self.record(ds, true);
    }

    pub fn record_miss(&self, ds: &DataSourceId) {
        self.record(ds, false);
    }

    /// Count a read served straight from the warehouse because the store
    /// was unavailable.
    pub fn record_slow_path(&self, ds: &DataSourceId) {
        self.slow_path_reads.fetch_add(1, Ordering::Relaxed);
        self.record(ds, false);
    }

    pub fn slow_path_reads(&self) -> u64 {
        self.slow_path_reads.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self, ds: &DataSourceId) -> Option<f64> {
        let now = OffsetDateTime::now_utc();
        self.windows.get(ds).and_then(|w| w.hit_rate(now))
    }

    pub fn totals(&self, ds: &DataSourceId) -> (u64, u64) {
        let now = OffsetDateTime::now_utc();
        self.windows.get(ds).map_or((0, 0), |w| w.totals(now))
    }

    fn record(&self, ds: &DataSourceId, hit: bool) {
        let now = OffsetDateTime::now_utc();
        self.windows
            .entry(ds.clone())
            .or_insert_with(|| HitRateWindow::new(self.window_minutes))
            .record(hit, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use time::macros::datetime;

    #[test]
    fn test_hit_rate() {
        let now = datetime!(2024-06-01 12:00 UTC);
        let mut window = HitRateWindow::new(15);
        assert_eq!(window.hit_rate(now), None);

        for _ in 0..3 {
            window.record(true, now);
        }
        window.record(false, now + Duration::from_secs(61));
        assert_eq!(window.totals(now + Duration::from_secs(61)), (3, 1));
        assert_eq!(window.hit_rate(now + Duration::from_secs(61)), Some(0.75));
    }

    #[test]
    fn test_old_buckets_fall_out() {
        let start = datetime!(2024-06-01 12:00 UTC);
        let mut window = HitRateWindow::new(5);
        window.record(true, start);
        window.record(false, start + Duration::from_secs(4 * 60));

        assert_eq!(window.totals(start + Duration::from_secs(4 * 60)), (1, 1));
        // Five minutes later the first bucket is outside the window.
        assert_eq!(window.totals(start + Duration::from_secs(5 * 60)), (0, 1));

        window.record(true, start + Duration::from_secs(30 * 60));
        assert_eq!(window.buckets.len(), 1);
    }

    #[test]
    fn test_clock_stepping_back_keeps_buckets_ordered() {
        let now = datetime!(2024-06-01 12:10 UTC);
        let mut window = HitRateWindow::new(5);
        window.record(true, now);
        window.record(false, now - Duration::from_secs(3 * 60));
        window.record(true, now);

        assert_eq!(window.buckets.len(), 1);
        assert_eq!(window.totals(now), (2, 1));

        // Eviction still works once the clock moves on.
        window.record(true, now + Duration::from_secs(10 * 60));
        assert_eq!(window.buckets.len(), 1);
        assert_eq!(window.totals(now + Duration::from_secs(10 * 60)), (1, 0));
    }

    #[test]
    fn test_cache_stats_per_data_source() {
        let stats = CacheStats::default();
        let a = DataSourceId::parse("a").unwrap();
        let b = DataSourceId::parse("b").unwrap();

        stats.record_hit(&a);
        stats.record_miss(&a);
        stats.record_slow_path(&b);

        assert_eq!(stats.hit_rate(&a), Some(0.5));
        assert_eq!(stats.hit_rate(&b), Some(0.0));
        assert_eq!(stats.slow_path_reads(), 1);
        assert_eq!(stats.totals(&DataSourceId::parse("c").unwrap()), (0, 0));
    }
}
