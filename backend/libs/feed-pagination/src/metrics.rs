/// Prometheus metrics for feed pagination
#[cfg(feature = "metrics")]
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;

#[cfg(feature = "metrics")]
static PAGE_FETCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_page_fetches_total",
        "Page fetch attempts by outcome",
        &["result"]
    )
    .expect("Failed to register page fetches metric")
});

#[cfg(feature = "metrics")]
static PAGES_EVICTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_pages_evicted_total",
        "Cached pages dropped from the head of a feed",
        &["reason"]
    )
    .expect("Failed to register pages evicted metric")
});

#[cfg(feature = "metrics")]
static SCHEDULER_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_scheduler_events_total",
        "Proximity events and what the scheduler did with them",
        &["action"]
    )
    .expect("Failed to register scheduler events metric")
});

#[cfg(feature = "metrics")]
static RETRY_ATTEMPTS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "feed_retry_attempts",
        "Number of attempts before success or failure",
        &["result"]
    )
    .expect("Failed to register retry attempts metric")
});

/// Metrics collector for the page cache
#[cfg(feature = "metrics")]
pub struct CacheMetrics;

#[cfg(feature = "metrics")]
impl CacheMetrics {
    pub fn record_fetch(result: &str) {
        PAGE_FETCHES.with_label_values(&[result]).inc();
    }

    pub fn record_eviction(pages: usize) {
        PAGES_EVICTED
            .with_label_values(&["max_cached_pages"])
            .inc_by(pages as u64);
    }
}

/// Metrics collector for the fetch scheduler
#[cfg(feature = "metrics")]
pub struct SchedulerMetrics;

#[cfg(feature = "metrics")]
impl SchedulerMetrics {
    pub fn record_event(action: &str) {
        SCHEDULER_EVENTS.with_label_values(&[action]).inc();
    }
}

/// Metrics collector for retries
#[cfg(feature = "metrics")]
pub struct RetryMetrics;

#[cfg(feature = "metrics")]
impl RetryMetrics {
    pub fn record_attempts(result: &str, attempts: u32) {
        RETRY_ATTEMPTS
            .with_label_values(&[result])
            .observe(attempts as f64);
    }
}

// No-op implementations when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub struct CacheMetrics;

#[cfg(not(feature = "metrics"))]
impl CacheMetrics {
    pub fn record_fetch(_result: &str) {}
    pub fn record_eviction(_pages: usize) {}
}

#[cfg(not(feature = "metrics"))]
pub struct SchedulerMetrics;

#[cfg(not(feature = "metrics"))]
impl SchedulerMetrics {
    pub fn record_event(_action: &str) {}
}

#[cfg(not(feature = "metrics"))]
pub struct RetryMetrics;

#[cfg(not(feature = "metrics"))]
impl RetryMetrics {
    pub fn record_attempts(_result: &str, _attempts: u32) {}
}
