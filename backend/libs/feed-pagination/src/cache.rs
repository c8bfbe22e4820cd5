//! Client-side page cache for cursor-paginated feeds
//!
//! One `PagedCacheManager` owns the state of every feed a session observes:
//! - Pages in fetch order, each a contiguous slice of the feed
//! - The cursor for the next forward fetch and the `has_more` flag
//! - A single-flight guard so a feed never has two fetches outstanding
//!
//! Memory is bounded by dropping the oldest pages once `max_cached_pages` is
//! exceeded. Forward fetching only depends on the newest page's cursor, so
//! eviction never breaks continuity. Real-time inserts are only ever placed at
//! the head of the first page.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FeedConfig;
use crate::error::{FeedError, Result};
use crate::metrics::CacheMetrics;
use crate::protocol::{Cursor, FeedId, FeedItem, Page, PageRequest, PageSource};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What a presentation layer renders
#[derive(Debug, Clone, PartialEq)]
pub struct FlattenedView<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub is_fetching_next: bool,
    /// Message of the last failed fetch, cleared by the next success
    pub last_error: Option<String>,
}

/// `FlattenedView` without the items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchStatus {
    pub has_more: bool,
    pub is_fetching_next: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Appended { items: usize, has_more: bool },
    /// Another fetch for this feed is outstanding; nothing was requested
    InFlight,
    /// The feed has no more pages; nothing was requested
    Exhausted,
    /// The feed was reset or torn down while the fetch was outstanding;
    /// the result was discarded
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrependOutcome {
    Prepended,
    /// The item is already cached
    Duplicate,
    /// The item does not sort ahead of the current head
    OutOfOrder,
    /// Nothing cached to attach to (not fetched yet, head evicted, or unknown
    /// feed); the next fetch from the start of the feed will include it
    NoHead,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub pages_cached: usize,
    pub items_cached: usize,
    pub pages_evicted: u64,
    pub successful_fetches: u64,
    pub failed_fetches: u64,
}

/// Change notifications for whoever renders the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    PageAppended { feed: FeedId, items: usize, has_more: bool },
    ItemPrepended { feed: FeedId, item_id: Uuid },
    ItemReplaced { feed: FeedId, item_id: Uuid },
    FetchFailed { feed: FeedId, error: String },
    Reset { feed: FeedId },
    TornDown { feed: FeedId },
}

struct CachedPage<T> {
    seq: u64,
    items: Vec<T>,
}

struct InFlight {
    seq: u64,
    token: CancellationToken,
}

struct FeedState<T> {
    generation: u64,
    pages: VecDeque<CachedPage<T>>,
    ids: HashSet<Uuid>,
    next_cursor: Option<Cursor>,
    has_more: bool,
    head_evicted: bool,
    in_flight: Option<InFlight>,
    last_error: Option<String>,
    next_page_seq: u64,
    stats: FeedStats,
}

impl<T: FeedItem> FeedState<T> {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            pages: VecDeque::new(),
            ids: HashSet::new(),
            next_cursor: None,
            has_more: true,
            head_evicted: false,
            in_flight: None,
            last_error: None,
            next_page_seq: 0,
            stats: FeedStats::default(),
        }
    }

    fn cancel_in_flight(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.token.cancel();
        }
    }

    /// Append a fetched page and enforce the page ceiling.
    ///
    /// Returns the number of items kept and pages evicted.
    fn append(&mut self, feed: &FeedId, page: Page<T>, max_pages: usize) -> (usize, usize) {
        let (items, next_cursor) = page.into_parts();
        let received = items.len();

        let mut kept = Vec::with_capacity(received);
        for item in items {
            if self.ids.insert(item.item_id()) {
                kept.push(item);
            }
        }
        if kept.len() < received {
            warn!(
                feed = %feed,
                dropped = received - kept.len(),
                "Dropped already-cached items from fetched page"
            );
        }

        self.has_more = next_cursor.is_some();
        self.next_cursor = next_cursor;
        self.last_error = None;
        self.stats.successful_fetches += 1;

        let count = kept.len();
        if !kept.is_empty() {
            let seq = self.next_page_seq;
            self.next_page_seq += 1;
            self.pages.push_back(CachedPage { seq, items: kept });
        }

        let mut evicted = 0;
        while self.pages.len() > max_pages {
            if let Some(oldest) = self.pages.pop_front() {
                for item in &oldest.items {
                    self.ids.remove(&item.item_id());
                }
                self.head_evicted = true;
                evicted += 1;
            }
        }
        self.stats.pages_evicted += evicted as u64;

        (count, evicted)
    }

    fn prepend(&mut self, item: T) -> PrependOutcome {
        if self.ids.contains(&item.item_id()) {
            return PrependOutcome::Duplicate;
        }
        if self.head_evicted {
            return PrependOutcome::NoHead;
        }

        match self.pages.front_mut() {
            Some(first) => {
                if let Some(head) = first.items.first() {
                    if !item.sort_key().precedes(&head.sort_key()) {
                        return PrependOutcome::OutOfOrder;
                    }
                }
                self.ids.insert(item.item_id());
                first.items.insert(0, item);
                PrependOutcome::Prepended
            }
            // Fetched, but the feed was empty: the item becomes the whole head.
            None if self.stats.successful_fetches > 0 => {
                self.ids.insert(item.item_id());
                let seq = self.next_page_seq;
                self.next_page_seq += 1;
                self.pages.push_back(CachedPage {
                    seq,
                    items: vec![item],
                });
                PrependOutcome::Prepended
            }
            None => PrependOutcome::NoHead,
        }
    }

    fn view(&self) -> FlattenedView<T> {
        let items = self
            .pages
            .iter()
            .flat_map(|page| page.items.iter().cloned())
            .collect();
        FlattenedView {
            items,
            has_more: self.has_more,
            is_fetching_next: self.in_flight.is_some(),
            last_error: self.last_error.clone(),
        }
    }

    fn stats(&self) -> FeedStats {
        FeedStats {
            pages_cached: self.pages.len(),
            items_cached: self.ids.len(),
            ..self.stats
        }
    }
}

/// Copy of one cached page, taken before a tentative change
#[derive(Debug, Clone)]
pub struct PageSnapshot<T> {
    pub(crate) generation: u64,
    pub(crate) page_seq: u64,
    pub(crate) items: Vec<T>,
}

impl<T> PageSnapshot<T> {
    pub fn items(&self) -> &[T] {
        &self.items
    }
}

pub struct PagedCacheManager<T, S> {
    source: S,
    config: FeedConfig,
    feeds: Mutex<HashMap<FeedId, FeedState<T>>>,
    generations: AtomicU64,
    fetch_seq: AtomicU64,
    events: broadcast::Sender<FeedEvent>,
}

/// Clears the single-flight guard if the fetch future is dropped before it
/// completes.
struct InFlightGuard<'a, T> {
    feeds: &'a Mutex<HashMap<FeedId, FeedState<T>>>,
    feed: &'a FeedId,
    generation: u64,
    seq: u64,
}

impl<T> Drop for InFlightGuard<'_, T> {
    fn drop(&mut self) {
        let mut feeds = self.feeds.lock();
        if let Some(state) = feeds.get_mut(self.feed) {
            let ours = state.generation == self.generation
                && state.in_flight.as_ref().map(|f| f.seq) == Some(self.seq);
            if ours {
                state.in_flight = None;
            }
        }
    }
}

impl<T, S> PagedCacheManager<T, S>
where
    T: FeedItem,
    S: PageSource<T>,
{
    pub fn new(source: S, config: FeedConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            source,
            config,
            feeds: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            fetch_seq: AtomicU64::new(0),
            events,
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: FeedEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start observing a feed. Idempotent.
    pub fn subscribe(&self, feed: &FeedId) {
        let mut feeds = self.feeds.lock();
        if !feeds.contains_key(feed) {
            debug!(feed = %feed, "Feed subscribed");
            feeds.insert(feed.clone(), FeedState::new(self.next_generation()));
        }
    }

    pub fn is_subscribed(&self, feed: &FeedId) -> bool {
        self.feeds.lock().contains_key(feed)
    }

    /// Current items, `has_more` and fetch status. Never performs I/O.
    pub fn get_flattened_view(&self, feed: &FeedId) -> Option<FlattenedView<T>> {
        self.feeds.lock().get(feed).map(FeedState::view)
    }

    pub fn fetch_status(&self, feed: &FeedId) -> Option<FetchStatus> {
        self.feeds.lock().get(feed).map(|state| FetchStatus {
            has_more: state.has_more,
            is_fetching_next: state.in_flight.is_some(),
        })
    }

    pub fn feed_stats(&self, feed: &FeedId) -> Option<FeedStats> {
        self.feeds.lock().get(feed).map(FeedState::stats)
    }

    /// Cursor the next forward fetch will use
    pub fn next_cursor(&self, feed: &FeedId) -> Option<Cursor> {
        self.feeds
            .lock()
            .get(feed)
            .and_then(|state| state.next_cursor.clone())
    }

    /// Fetch and append the next page of `feed`.
    ///
    /// No-op while another fetch for the feed is outstanding or once the feed
    /// is exhausted. On failure cached pages are left untouched and the error
    /// is returned; the feed resumes from the same cursor next time.
    pub async fn fetch_next_page(&self, feed: &FeedId) -> Result<FetchOutcome> {
        self.fetch(feed, true).await
    }

    /// Like [`fetch_next_page`](Self::fetch_next_page), but an unknown (torn
    /// down) feed yields `Superseded` instead of being subscribed again.
    pub async fn fetch_next_page_if_subscribed(&self, feed: &FeedId) -> Result<FetchOutcome> {
        self.fetch(feed, false).await
    }

    async fn fetch(&self, feed: &FeedId, subscribe: bool) -> Result<FetchOutcome> {
        let (request, token, generation, seq) = {
            let mut feeds = self.feeds.lock();
            let state = if subscribe {
                feeds
                    .entry(feed.clone())
                    .or_insert_with(|| FeedState::new(self.next_generation()))
            } else {
                match feeds.get_mut(feed) {
                    Some(state) => state,
                    None => return Ok(FetchOutcome::Superseded),
                }
            };

            if state.in_flight.is_some() {
                debug!(feed = %feed, "Fetch already in flight, skipping");
                CacheMetrics::record_fetch("in_flight");
                return Ok(FetchOutcome::InFlight);
            }
            if !state.has_more {
                debug!(feed = %feed, "Feed exhausted, skipping fetch");
                return Ok(FetchOutcome::Exhausted);
            }

            let request =
                PageRequest::new(feed.clone(), state.next_cursor.clone(), self.config.page_size)?;
            let token = CancellationToken::new();
            let seq = self.fetch_seq.fetch_add(1, Ordering::SeqCst);
            state.in_flight = Some(InFlight {
                seq,
                token: token.clone(),
            });
            (request, token, state.generation, seq)
        };

        let _guard = InFlightGuard {
            feeds: &self.feeds,
            feed,
            generation,
            seq,
        };

        debug!(feed = %feed, cursor = ?request.cursor, limit = request.limit, "Fetching next page");
        let timeout = self.config.fetch_timeout();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(FeedError::RequestSuperseded),
            fetched = tokio::time::timeout(timeout, self.source.fetch_page(&request)) => match fetched {
                Ok(result) => result,
                Err(_) => Err(FeedError::unavailable(format!(
                    "page fetch timed out after {:?}",
                    timeout
                ))),
            },
        };

        self.complete_fetch(feed, generation, result)
    }

    fn complete_fetch(
        &self,
        feed: &FeedId,
        generation: u64,
        result: Result<Page<T>>,
    ) -> Result<FetchOutcome> {
        let mut feeds = self.feeds.lock();
        let state = match feeds.get_mut(feed) {
            Some(state) if state.generation == generation => state,
            _ => {
                debug!(feed = %feed, "Discarding page for reset or torn-down feed");
                CacheMetrics::record_fetch("superseded");
                return Ok(FetchOutcome::Superseded);
            }
        };
        state.in_flight = None;

        match result {
            Ok(page) => {
                let (items, evicted) = state.append(feed, page, self.config.max_cached_pages);
                let has_more = state.has_more;
                drop(feeds);

                CacheMetrics::record_fetch("success");
                if evicted > 0 {
                    debug!(feed = %feed, evicted, "Evicted oldest pages");
                    CacheMetrics::record_eviction(evicted);
                }
                if !has_more {
                    info!(feed = %feed, "Reached end of feed");
                }
                self.emit(FeedEvent::PageAppended {
                    feed: feed.clone(),
                    items,
                    has_more,
                });
                Ok(FetchOutcome::Appended { items, has_more })
            }
            Err(FeedError::RequestSuperseded) => {
                CacheMetrics::record_fetch("superseded");
                Ok(FetchOutcome::Superseded)
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                state.stats.failed_fetches += 1;
                drop(feeds);

                warn!(feed = %feed, error = %e, "Page fetch failed");
                CacheMetrics::record_fetch("error");
                self.emit(FeedEvent::FetchFailed {
                    feed: feed.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Place a real-time item at the head of the feed.
    ///
    /// Never touches stored cursors, so forward fetching is unaffected.
    pub fn prepend_external_item(&self, feed: &FeedId, item: T) -> PrependOutcome {
        let item_id = item.item_id();
        let outcome = match self.feeds.lock().get_mut(feed) {
            Some(state) => state.prepend(item),
            None => PrependOutcome::NoHead,
        };

        match outcome {
            PrependOutcome::Prepended => {
                debug!(feed = %feed, item_id = %item_id, "Prepended external item");
                self.emit(FeedEvent::ItemPrepended {
                    feed: feed.clone(),
                    item_id,
                });
            }
            other => debug!(feed = %feed, item_id = %item_id, outcome = ?other, "External item not prepended"),
        }
        outcome
    }

    /// Drop cached pages and start over from the beginning of the feed.
    /// Any outstanding fetch is cancelled and its result discarded.
    pub fn reset(&self, feed: &FeedId) {
        let generation = self.next_generation();
        {
            let mut feeds = self.feeds.lock();
            let Some(state) = feeds.get_mut(feed) else {
                return;
            };
            state.cancel_in_flight();
            *state = FeedState::new(generation);
        }
        info!(feed = %feed, "Feed reset");
        self.emit(FeedEvent::Reset { feed: feed.clone() });
    }

    /// Destroy all state for a feed that is no longer observed
    pub fn teardown(&self, feed: &FeedId) {
        let removed = self.feeds.lock().remove(feed);
        if let Some(mut state) = removed {
            state.cancel_in_flight();
            debug!(feed = %feed, "Feed torn down");
            self.emit(FeedEvent::TornDown { feed: feed.clone() });
        }
    }

    /// Copy the page holding `item_id`
    pub fn snapshot_page(&self, feed: &FeedId, item_id: Uuid) -> Option<PageSnapshot<T>> {
        let feeds = self.feeds.lock();
        let state = feeds.get(feed)?;
        state
            .pages
            .iter()
            .find(|page| page.items.iter().any(|item| item.item_id() == item_id))
            .map(|page| PageSnapshot {
                generation: state.generation,
                page_seq: page.seq,
                items: page.items.clone(),
            })
    }

    /// Replace one item of the snapshotted page, but only if it still
    /// equals `expected`. Other items of the page are left as they are.
    ///
    /// Returns false when the feed was reset, the page evicted, or the item
    /// changed since `expected` was read.
    pub(crate) fn compare_and_swap_item(
        &self,
        feed: &FeedId,
        snapshot: &PageSnapshot<T>,
        expected: &T,
        replacement: T,
    ) -> bool
    where
        T: PartialEq,
    {
        let item_id = expected.item_id();
        let mut feeds = self.feeds.lock();
        let Some(state) = feeds.get_mut(feed) else {
            return false;
        };
        if state.generation != snapshot.generation {
            return false;
        }
        let Some(page) = state.pages.iter_mut().find(|p| p.seq == snapshot.page_seq) else {
            return false;
        };
        match page.items.iter_mut().find(|item| item.item_id() == item_id) {
            Some(item) if *item == *expected => {
                *item = replacement;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn notify_replaced(&self, feed: &FeedId, item_id: Uuid) {
        self.emit(FeedEvent::ItemReplaced {
            feed: feed.clone(),
            item_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SortKey;
    use crate::source::InMemoryFeedSource;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Post {
        key: SortKey,
    }

    impl FeedItem for Post {
        fn sort_key(&self) -> SortKey {
            self.key
        }
    }

    fn post(n: u128) -> Post {
        Post {
            key: SortKey::new(
                Utc.timestamp_millis_opt(n as i64 * 1000).unwrap(),
                Uuid::from_u128(n),
            ),
        }
    }

    fn manager(
        items: u128,
        page_size: u32,
        max_cached_pages: usize,
    ) -> PagedCacheManager<Post, Arc<InMemoryFeedSource<Post>>> {
        let source = Arc::new(InMemoryFeedSource::new());
        source.extend(&FeedId::from("global"), (1..=items).map(post));
        let config = FeedConfig {
            page_size,
            max_cached_pages,
            ..Default::default()
        };
        PagedCacheManager::new(source, config)
    }

    fn ids(view: &FlattenedView<Post>) -> Vec<u128> {
        view.items.iter().map(|p| p.key.id.as_u128()).collect()
    }

    #[tokio::test]
    async fn test_view_of_unknown_feed_is_none() {
        let cache = manager(5, 2, 10);
        assert!(cache.get_flattened_view(&FeedId::from("global")).is_none());
        cache.subscribe(&FeedId::from("global"));
        let view = cache.get_flattened_view(&FeedId::from("global")).unwrap();
        assert!(view.items.is_empty());
        assert!(view.has_more);
        assert!(!view.is_fetching_next);
    }

    #[tokio::test]
    async fn test_fetch_status_tracks_view() {
        let cache = manager(5, 3, 10);
        let feed = FeedId::from("global");
        assert!(cache.fetch_status(&feed).is_none());

        cache.fetch_next_page(&feed).await.unwrap();
        let status = cache.fetch_status(&feed).unwrap();
        assert!(status.has_more);
        assert!(!status.is_fetching_next);

        cache.fetch_next_page(&feed).await.unwrap();
        let view = cache.get_flattened_view(&feed).unwrap();
        assert_eq!(
            cache.fetch_status(&feed),
            Some(FetchStatus {
                has_more: view.has_more,
                is_fetching_next: view.is_fetching_next,
            })
        );
        assert!(!view.has_more);
    }

    #[tokio::test]
    async fn test_empty_page_not_cached() {
        let cache = manager(0, 5, 10);
        let feed = FeedId::from("global");

        let outcome = cache.fetch_next_page(&feed).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Appended { items: 0, has_more: false });
        assert_eq!(cache.feed_stats(&feed).unwrap().pages_cached, 0);
    }

    #[tokio::test]
    async fn test_prepend_into_fetched_empty_feed() {
        let cache = manager(0, 5, 10);
        let feed = FeedId::from("global");
        cache.fetch_next_page(&feed).await.unwrap();

        assert_eq!(cache.prepend_external_item(&feed, post(9)), PrependOutcome::Prepended);
        assert_eq!(ids(&cache.get_flattened_view(&feed).unwrap()), vec![9]);
    }

    #[tokio::test]
    async fn test_prepend_before_first_fetch_is_deferred() {
        let cache = manager(3, 5, 10);
        let feed = FeedId::from("global");
        cache.subscribe(&feed);
        assert_eq!(cache.prepend_external_item(&feed, post(9)), PrependOutcome::NoHead);
        assert_eq!(
            cache.prepend_external_item(&FeedId::from("unknown"), post(9)),
            PrependOutcome::NoHead
        );
    }

    #[tokio::test]
    async fn test_prepend_rejects_out_of_order_and_duplicates() {
        let cache = manager(10, 5, 10);
        let feed = FeedId::from("global");
        cache.fetch_next_page(&feed).await.unwrap();

        assert_eq!(cache.prepend_external_item(&feed, post(10)), PrependOutcome::Duplicate);
        assert_eq!(cache.prepend_external_item(&feed, post(3)), PrependOutcome::OutOfOrder);
        assert_eq!(cache.prepend_external_item(&feed, post(11)), PrependOutcome::Prepended);
        assert_eq!(
            ids(&cache.get_flattened_view(&feed).unwrap()),
            vec![11, 10, 9, 8, 7, 6]
        );
    }

    #[tokio::test]
    async fn test_reset_clears_pages_and_restarts() {
        let cache = manager(10, 3, 10);
        let feed = FeedId::from("global");
        cache.fetch_next_page(&feed).await.unwrap();
        cache.fetch_next_page(&feed).await.unwrap();

        cache.reset(&feed);
        let view = cache.get_flattened_view(&feed).unwrap();
        assert!(view.items.is_empty());
        assert!(view.has_more);
        assert!(cache.next_cursor(&feed).is_none());

        cache.fetch_next_page(&feed).await.unwrap();
        assert_eq!(ids(&cache.get_flattened_view(&feed).unwrap()), vec![10, 9, 8]);
    }

    #[tokio::test]
    async fn test_teardown_removes_state() {
        let cache = manager(10, 3, 10);
        let feed = FeedId::from("global");
        let mut events = cache.subscribe_events();
        cache.fetch_next_page(&feed).await.unwrap();

        cache.teardown(&feed);
        assert!(!cache.is_subscribed(&feed));
        assert!(cache.get_flattened_view(&feed).is_none());

        assert!(matches!(events.recv().await.unwrap(), FeedEvent::PageAppended { .. }));
        assert_eq!(events.recv().await.unwrap(), FeedEvent::TornDown { feed });
    }

    #[tokio::test]
    async fn test_bad_page_size_surfaces_bad_request() {
        let cache = manager(10, 0, 10);
        let feed = FeedId::from("global");
        let err = cache.fetch_next_page(&feed).await.unwrap_err();
        assert!(matches!(err, FeedError::BadRequest(_)));
        assert!(!cache.get_flattened_view(&feed).unwrap().is_fetching_next);
    }
}
