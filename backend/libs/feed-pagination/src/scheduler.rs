//! Scroll-driven fetch scheduling
//!
//! The presentation layer reports "the viewport reached the load trigger" via a
//! [`ProximityHandle`]. Per feed the scheduler runs a small state machine:
//!
//! - Idle → PendingDebounce: proximity event starts the debounce timer
//! - PendingDebounce → PendingDebounce: another event restarts the timer
//! - PendingDebounce → Fetching: timer fired, feed has more, nothing in flight
//! - PendingDebounce → Exhausted: timer fired, feed has no more
//! - Fetching → Idle: fetch succeeded with more to come, or failed
//! - Fetching → Exhausted: fetch reached the end of the feed
//!
//! Exhausted is only left through `reset`. Failed fetches are retried with
//! bounded backoff (transient errors only), then wait for the next proximity
//! event or an explicit `retry_now`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{FetchOutcome, PagedCacheManager};
use crate::config::InvalidCursorPolicy;
use crate::error::{FeedError, Result};
use crate::metrics::SchedulerMetrics;
use crate::protocol::{FeedId, FeedItem, PageSource};
use crate::retry::with_retry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    Idle,
    PendingDebounce,
    Fetching,
    Exhausted,
}

struct Entry {
    phase: SchedulePhase,
    /// Bumped whenever a timer starts or the feed is reset; stale timers and
    /// fetches compare against it
    epoch: u64,
    debounce: Option<CancellationToken>,
}

impl Entry {
    fn cancel_debounce(&mut self) -> bool {
        match self.debounce.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

struct Inner<T, S> {
    cache: Arc<PagedCacheManager<T, S>>,
    entries: Mutex<HashMap<FeedId, Entry>>,
    epochs: AtomicU64,
    runtime: Handle,
}

pub struct FetchScheduler<T, S> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for FetchScheduler<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Push-style callback the visibility observer calls for one feed
pub struct ProximityHandle<T, S> {
    scheduler: FetchScheduler<T, S>,
    feed: FeedId,
}

impl<T, S> Clone for ProximityHandle<T, S> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            feed: self.feed.clone(),
        }
    }
}

impl<T, S> ProximityHandle<T, S>
where
    T: FeedItem,
    S: PageSource<T> + 'static,
{
    pub fn feed(&self) -> &FeedId {
        &self.feed
    }

    /// `true` when the viewport entered the load-trigger region
    pub fn near_end(&self, is_near: bool) {
        self.scheduler.on_proximity(&self.feed, is_near);
    }

    /// The view is gone: stop observing and drop the feed's state
    pub fn teardown(self) {
        self.scheduler.teardown(&self.feed);
    }
}

impl<T, S> FetchScheduler<T, S>
where
    T: FeedItem,
    S: PageSource<T> + 'static,
{
    /// Must be called from within a tokio runtime; debounce timers run on it.
    pub fn new(cache: Arc<PagedCacheManager<T, S>>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            FeedError::Config("fetch scheduler must be created inside a tokio runtime".to_string())
        })?;

        Ok(Self {
            inner: Arc::new(Inner {
                cache,
                entries: Mutex::new(HashMap::new()),
                epochs: AtomicU64::new(0),
                runtime,
            }),
        })
    }

    pub fn cache(&self) -> &Arc<PagedCacheManager<T, S>> {
        &self.inner.cache
    }

    fn next_epoch(&self) -> u64 {
        self.inner.epochs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start observing `feed` and hand back the callback for its visibility
    /// observer. Registering an observed feed again returns a handle to the
    /// same state.
    pub fn register(&self, feed: FeedId) -> ProximityHandle<T, S> {
        self.inner.cache.subscribe(&feed);
        {
            let mut entries = self.inner.entries.lock();
            if !entries.contains_key(&feed) {
                let epoch = self.next_epoch();
                entries.insert(
                    feed.clone(),
                    Entry {
                        phase: SchedulePhase::Idle,
                        epoch,
                        debounce: None,
                    },
                );
                debug!(feed = %feed, "Registered feed for proximity scheduling");
            }
        }

        ProximityHandle {
            scheduler: self.clone(),
            feed,
        }
    }

    pub fn phase(&self, feed: &FeedId) -> Option<SchedulePhase> {
        self.inner.entries.lock().get(feed).map(|entry| entry.phase)
    }

    pub fn on_proximity(&self, feed: &FeedId, is_near: bool) {
        if !is_near {
            return;
        }

        let debounce = self.inner.cache.config().debounce();
        let (token, epoch) = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(feed) else {
                debug!(feed = %feed, "Proximity event for unregistered feed ignored");
                return;
            };

            match entry.phase {
                SchedulePhase::Fetching | SchedulePhase::Exhausted => {
                    debug!(feed = %feed, phase = ?entry.phase, "Proximity event ignored");
                    SchedulerMetrics::record_event("ignored");
                    return;
                }
                SchedulePhase::Idle | SchedulePhase::PendingDebounce => {
                    if entry.cancel_debounce() {
                        SchedulerMetrics::record_event("debounce_restarted");
                    } else {
                        SchedulerMetrics::record_event("debounce_started");
                    }
                    let token = CancellationToken::new();
                    entry.phase = SchedulePhase::PendingDebounce;
                    entry.epoch = self.next_epoch();
                    entry.debounce = Some(token.clone());
                    (token, entry.epoch)
                }
            }
        };

        let scheduler = self.clone();
        let feed = feed.clone();
        self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(debounce) => {
                    scheduler.debounce_elapsed(&feed, epoch).await;
                }
            }
        });
    }

    async fn debounce_elapsed(&self, feed: &FeedId, epoch: u64) {
        {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(feed) else {
                return;
            };
            if entry.epoch != epoch || entry.phase != SchedulePhase::PendingDebounce {
                return;
            }
            entry.debounce = None;

            let Some(status) = self.inner.cache.fetch_status(feed) else {
                entry.phase = SchedulePhase::Idle;
                return;
            };
            if !status.has_more {
                info!(feed = %feed, "Feed exhausted");
                entry.phase = SchedulePhase::Exhausted;
                SchedulerMetrics::record_event("exhausted");
                return;
            }
            if status.is_fetching_next {
                debug!(feed = %feed, "Fetch already in flight, returning to idle");
                entry.phase = SchedulePhase::Idle;
                return;
            }
            entry.phase = SchedulePhase::Fetching;
        }

        SchedulerMetrics::record_event("fetch");
        // Errors were already logged and recorded on the feed
        let _ = self.run_fetch(feed, epoch).await;
    }

    fn is_current(&self, feed: &FeedId, epoch: u64) -> bool {
        self.inner
            .entries
            .lock()
            .get(feed)
            .map(|entry| entry.epoch == epoch)
            .unwrap_or(false)
    }

    async fn run_fetch(&self, feed: &FeedId, epoch: u64) -> Result<FetchOutcome> {
        let cache = &self.inner.cache;
        let retry = cache.config().retry_config();

        let result = with_retry(&retry, move || async move {
            if !self.is_current(feed, epoch) {
                return Err(FeedError::RequestSuperseded);
            }
            cache.fetch_next_page_if_subscribed(feed).await
        })
        .await;

        let restart = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(feed).filter(|entry| entry.epoch == epoch) else {
                debug!(feed = %feed, "Feed reset or torn down during fetch, discarding outcome");
                return Ok(FetchOutcome::Superseded);
            };

            let mut restart = false;
            entry.phase = match &result {
                Ok(FetchOutcome::Appended { has_more: true, .. }) => SchedulePhase::Idle,
                Ok(FetchOutcome::Appended { has_more: false, .. }) | Ok(FetchOutcome::Exhausted) => {
                    info!(feed = %feed, "Feed exhausted");
                    SchedulePhase::Exhausted
                }
                Ok(FetchOutcome::InFlight) | Ok(FetchOutcome::Superseded) => SchedulePhase::Idle,
                Err(FeedError::InvalidCursor(reason)) => {
                    match cache.config().invalid_cursor_policy {
                        InvalidCursorPolicy::Restart => {
                            warn!(feed = %feed, reason = %reason, "Cursor no longer valid, restarting feed");
                            restart = true;
                            SchedulePhase::Idle
                        }
                        InvalidCursorPolicy::Stop => {
                            warn!(feed = %feed, reason = %reason, "Cursor no longer valid, stopping feed");
                            SchedulePhase::Exhausted
                        }
                    }
                }
                Err(e) => {
                    debug!(feed = %feed, error = %e, "Fetch failed, waiting for next proximity event");
                    SchedulePhase::Idle
                }
            };
            restart
        };

        if restart {
            cache.reset(feed);
        }
        result
    }

    /// Fetch immediately, bypassing the debounce (e.g. an inline "retry" button)
    pub async fn retry_now(&self, feed: &FeedId) -> Result<FetchOutcome> {
        let epoch = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(feed) else {
                return Err(FeedError::BadRequest(format!("feed {} is not registered", feed)));
            };
            match entry.phase {
                SchedulePhase::Fetching => return Ok(FetchOutcome::InFlight),
                SchedulePhase::Exhausted => return Ok(FetchOutcome::Exhausted),
                SchedulePhase::Idle | SchedulePhase::PendingDebounce => {
                    entry.cancel_debounce();
                    entry.phase = SchedulePhase::Fetching;
                    entry.epoch = self.next_epoch();
                    entry.epoch
                }
            }
        };

        SchedulerMetrics::record_event("retry_now");
        self.run_fetch(feed, epoch).await
    }

    /// Drop cached pages and return to `Idle`; the only way out of `Exhausted`
    pub fn reset(&self, feed: &FeedId) {
        {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(feed) {
                entry.cancel_debounce();
                entry.phase = SchedulePhase::Idle;
                entry.epoch = self.next_epoch();
            }
        }
        self.inner.cache.reset(feed);
    }

    /// Stop observing `feed`: cancel its timer, abandon any in-flight fetch
    /// and destroy its cached state
    pub fn teardown(&self, feed: &FeedId) {
        let removed = self.inner.entries.lock().remove(feed);
        if let Some(mut entry) = removed {
            entry.cancel_debounce();
            debug!(feed = %feed, "Unregistered feed");
        }
        self.inner.cache.teardown(feed);
    }
}
