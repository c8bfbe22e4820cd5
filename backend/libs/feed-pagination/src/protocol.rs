//! Cursor pagination contract between the cache and a data source
//!
//! Feeds are ordered by `(created_at, id)` descending. A cursor names the last
//! item of a page; the next page is everything strictly after that position,
//! so inserts or deletes ahead of the cursor never shift the window.
//!
//! Cursor format: base64("{created_at_millis}:{item_id}")

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{FeedError, Result};

/// Hard cap on a single page, regardless of what the caller asks for
pub const MAX_PAGE_SIZE: u32 = 100;

/// Opaque key of an independent paginated stream ("global", "following:<user>", ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedId(String);

impl FeedId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeedId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Position of an item in the feed's total order.
///
/// `Ord` is ascending; feeds iterate it in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SortKey {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl SortKey {
    pub fn new(created_at: DateTime<Utc>, id: Uuid) -> Self {
        Self { created_at, id }
    }

    /// True when `self` comes strictly before `other` in feed (descending) order.
    pub fn precedes(&self, other: &SortKey) -> bool {
        self > other
    }
}

/// Application record carried by a feed. Items are immutable once fetched.
pub trait FeedItem: Clone + Send + Sync + 'static {
    fn sort_key(&self) -> SortKey;

    fn item_id(&self) -> Uuid {
        self.sort_key().id
    }
}

/// Opaque continuation token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn from_key(key: &SortKey) -> Self {
        let raw = format!("{}:{}", key.created_at.timestamp_millis(), key.id);
        Self(general_purpose::STANDARD.encode(raw))
    }

    /// Wrap a token received from elsewhere without validating it.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn decode(&self) -> Result<SortKey> {
        let decoded = general_purpose::STANDARD
            .decode(&self.0)
            .map_err(|_| FeedError::InvalidCursor("invalid cursor format".to_string()))?;
        let raw = String::from_utf8(decoded)
            .map_err(|_| FeedError::InvalidCursor("invalid cursor encoding".to_string()))?;

        let (millis, id) = raw
            .split_once(':')
            .ok_or_else(|| FeedError::InvalidCursor("missing cursor separator".to_string()))?;
        let millis = millis
            .parse::<i64>()
            .map_err(|_| FeedError::InvalidCursor("invalid cursor timestamp".to_string()))?;
        let created_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| FeedError::InvalidCursor("cursor timestamp out of range".to_string()))?;
        let id = Uuid::parse_str(id)
            .map_err(|_| FeedError::InvalidCursor("invalid cursor item id".to_string()))?;

        Ok(SortKey::new(created_at, id))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub feed: FeedId,
    /// `None` means start of feed
    pub cursor: Option<Cursor>,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(feed: FeedId, cursor: Option<Cursor>, limit: u32) -> Result<Self> {
        if limit == 0 {
            return Err(FeedError::BadRequest(
                "page limit must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            feed,
            cursor,
            limit: limit.min(MAX_PAGE_SIZE),
        })
    }

    /// Rows a source should read: one beyond the page to learn whether more exist.
    pub fn probe_limit(&self) -> usize {
        self.limit as usize + 1
    }
}

/// A contiguous slice of the feed plus its continuation.
///
/// `has_more` is derived from `next_cursor`, so the two can never disagree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    items: Vec<T>,
    next_cursor: Option<Cursor>,
    has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<Cursor>) -> Self {
        let has_more = next_cursor.is_some();
        Self {
            items,
            next_cursor,
            has_more,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn next_cursor(&self) -> Option<&Cursor> {
        self.next_cursor.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<T>, Option<Cursor>) {
        (self.items, self.next_cursor)
    }
}

impl<T: FeedItem> Page<T> {
    /// Build a page from up to `limit + 1` rows already in feed order.
    ///
    /// The probe row only signals that more exist; it is dropped and the
    /// cursor points at the last kept item.
    pub fn from_probe(mut rows: Vec<T>, limit: u32) -> Self {
        let limit = limit as usize;
        if rows.len() > limit {
            rows.truncate(limit);
            let next_cursor = rows.last().map(|item| Cursor::from_key(&item.sort_key()));
            Self::new(rows, next_cursor)
        } else {
            Self::new(rows, None)
        }
    }
}

#[derive(Deserialize)]
struct WirePage<T> {
    items: Vec<T>,
    #[serde(default)]
    next_cursor: Option<Cursor>,
    has_more: bool,
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Page<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = WirePage::<T>::deserialize(deserializer)?;
        if wire.has_more != wire.next_cursor.is_some() {
            return Err(serde::de::Error::custom(
                "has_more must be true exactly when next_cursor is present",
            ));
        }
        Ok(Page::new(wire.items, wire.next_cursor))
    }
}

/// A paginated data source
#[async_trait::async_trait]
pub trait PageSource<T: FeedItem>: Send + Sync {
    /// Return up to `request.limit` items strictly after `request.cursor`.
    ///
    /// Fails with `InvalidCursor` when the cursor no longer resolves and with
    /// `SourceUnavailable` on transport/storage failure. Read-only.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page<T>>;
}

#[async_trait::async_trait]
impl<T: FeedItem, S: PageSource<T> + ?Sized> PageSource<T> for std::sync::Arc<S> {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page<T>> {
        (**self).fetch_page(request).await
    }
}
