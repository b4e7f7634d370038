use metrics::{Counter, Gauge, Histogram};
use std::time::Duration;

pub struct Metrics {
    pub comparisons_run: Counter,
    pub comparisons_matched: Counter,
    pub comparisons_diffed: Counter,
    pub baselines_created: Counter,
    pub comparison_duration: Histogram,
    pub screenshots_uploaded: Counter,
    pub uploads_skipped: Counter,
    pub upload_failures: Counter,
    pub captures_taken: Counter,
    pub capture_failures: Counter,
    pub pool_utilization: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            comparisons_run: Counter::noop(),
            comparisons_matched: Counter::noop(),
            comparisons_diffed: Counter::noop(),
            baselines_created: Counter::noop(),
            comparison_duration: Histogram::noop(),
            screenshots_uploaded: Counter::noop(),
            uploads_skipped: Counter::noop(),
            upload_failures: Counter::noop(),
            captures_taken: Counter::noop(),
            capture_failures: Counter::noop(),
            pool_utilization: Gauge::noop(),
        }
    }

    pub fn record_comparison(&self, duration: Duration, matched: bool) {
        self.comparisons_run.increment(1);
        if matched {
            self.comparisons_matched.increment(1);
        } else {
            self.comparisons_diffed.increment(1);
        }
        self.comparison_duration.record(duration.as_secs_f64());
    }

    pub fn record_baseline_created(&self) {
        self.baselines_created.increment(1);
    }

    pub fn record_upload(&self, uploaded: usize, skipped: usize) {
        self.screenshots_uploaded.increment(uploaded as u64);
        self.uploads_skipped.increment(skipped as u64);
    }

    pub fn record_capture(&self, success: bool) {
        if success {
            self.captures_taken.increment(1);
        } else {
            self.capture_failures.increment(1);
        }
    }

    pub fn record_pool_utilization(&self, in_use: usize, total: usize) {
        if total > 0 {
            self.pool_utilization
                .set(in_use as f64 / total as f64 * 100.0);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
