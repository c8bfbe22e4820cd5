//! In-process feed source
//!
//! Keeps every feed as a keyset index ordered `(created_at, id)` descending and
//! answers page requests exactly the way a database-backed source should:
//! resolve the cursor's item, read `limit + 1` rows strictly after it, trim.

use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{FeedError, Result};
use crate::protocol::{FeedId, FeedItem, Page, PageRequest, PageSource, SortKey};

struct FeedRows<T> {
    ordered: BTreeMap<Reverse<SortKey>, T>,
    keys: HashMap<Uuid, SortKey>,
}

impl<T> Default for FeedRows<T> {
    fn default() -> Self {
        Self {
            ordered: BTreeMap::new(),
            keys: HashMap::new(),
        }
    }
}

pub struct InMemoryFeedSource<T> {
    feeds: RwLock<HashMap<FeedId, FeedRows<T>>>,
    calls: AtomicUsize,
    injected_failures: Mutex<VecDeque<FeedError>>,
    latency: Option<Duration>,
}

impl<T: FeedItem> Default for InMemoryFeedSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FeedItem> InMemoryFeedSource<T> {
    pub fn new() -> Self {
        Self {
            feeds: RwLock::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            injected_failures: Mutex::new(VecDeque::new()),
            latency: None,
        }
    }

    /// Delay every `fetch_page` by `latency` (simulates a network round trip)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Insert or replace an item. Returns false when the id was already present.
    pub fn insert(&self, feed: &FeedId, item: T) -> bool {
        let key = item.sort_key();
        let mut feeds = self.feeds.write();
        let rows = feeds.entry(feed.clone()).or_default();

        let fresh = match rows.keys.insert(key.id, key) {
            Some(previous) => {
                rows.ordered.remove(&Reverse(previous));
                false
            }
            None => true,
        };
        rows.ordered.insert(Reverse(key), item);
        fresh
    }

    pub fn extend(&self, feed: &FeedId, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.insert(feed, item);
        }
    }

    pub fn remove(&self, feed: &FeedId, id: Uuid) -> Option<T> {
        let mut feeds = self.feeds.write();
        let rows = feeds.get_mut(feed)?;
        let key = rows.keys.remove(&id)?;
        rows.ordered.remove(&Reverse(key))
    }

    pub fn len(&self, feed: &FeedId) -> usize {
        self.feeds
            .read()
            .get(feed)
            .map(|rows| rows.ordered.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, feed: &FeedId) -> bool {
        self.len(feed) == 0
    }

    /// Number of `fetch_page` calls served so far (including failed ones)
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make the next `fetch_page` call fail with `error`
    pub fn fail_next(&self, error: FeedError) {
        self.injected_failures.lock().push_back(error);
    }

    fn read_page(&self, request: &PageRequest) -> Result<Page<T>> {
        let feeds = self.feeds.read();
        let Some(rows) = feeds.get(&request.feed) else {
            return Ok(Page::new(Vec::new(), None));
        };

        let lower = match &request.cursor {
            Some(cursor) => {
                let position = cursor.decode()?;
                // The stored key is authoritative; the one in the token is a hint.
                let key = rows.keys.get(&position.id).ok_or_else(|| {
                    FeedError::InvalidCursor(format!("item {} no longer exists", position.id))
                })?;
                Bound::Excluded(Reverse(*key))
            }
            None => Bound::Unbounded,
        };

        let rows: Vec<T> = rows
            .ordered
            .range((lower, Bound::Unbounded))
            .take(request.probe_limit())
            .map(|(_, item)| item.clone())
            .collect();

        Ok(Page::from_probe(rows, request.limit))
    }
}

#[async_trait::async_trait]
impl<T: FeedItem> PageSource<T> for InMemoryFeedSource<T> {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page<T>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(feed = %request.feed, cursor = ?request.cursor, limit = request.limit, call, "Serving page");

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.injected_failures.lock().pop_front() {
            return Err(error);
        }

        self.read_page(request)
    }
}
