//! Incremental feed loading for Nova clients
//!
//! Three layers, bottom-up:
//! - **Protocol** (`protocol`): keyset cursor pagination with an n+1 probe
//!   against any [`PageSource`]
//! - **Cache** (`cache`): per-feed pages with single-flight fetching, bounded
//!   memory and head-only reconciliation of real-time inserts
//! - **Scheduler** (`scheduler`): turns "viewport is near the end" signals into
//!   debounced `fetch_next_page` calls
//!
//! # Example
//!
//! ```rust,no_run
//! use feed_pagination::{FeedConfig, FeedId, FetchScheduler, HttpPageSource, PagedCacheManager};
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Clone, Deserialize)]
//! struct Post {
//!     id: uuid::Uuid,
//!     created_at: chrono::DateTime<chrono::Utc>,
//! }
//!
//! impl feed_pagination::FeedItem for Post {
//!     fn sort_key(&self) -> feed_pagination::SortKey {
//!         feed_pagination::SortKey::new(self.created_at, self.id)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> feed_pagination::Result<()> {
//!     let config = FeedConfig::from_env()?;
//!     let source = HttpPageSource::new("https://api.nova.dev/api/v2", config.fetch_timeout())?;
//!     let cache: Arc<PagedCacheManager<Post, _>> = Arc::new(PagedCacheManager::new(source, config));
//!     let scheduler = FetchScheduler::new(Arc::clone(&cache))?;
//!
//!     let handle = scheduler.register(FeedId::from("following"));
//!     // Wire to the visibility observer
//!     handle.near_end(true);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod optimistic;
pub mod protocol;
pub mod retry;
pub mod scheduler;
pub mod source;

pub use cache::{FeedEvent, FeedStats, FetchOutcome, FetchStatus, FlattenedView, PageSnapshot, PagedCacheManager, PrependOutcome};
pub use config::{FeedConfig, InvalidCursorPolicy};
pub use error::{FeedError, Result};
pub use optimistic::apply_optimistic;
pub use protocol::{Cursor, FeedId, FeedItem, Page, PageRequest, PageSource, SortKey, MAX_PAGE_SIZE};
pub use retry::{with_retry, RetryConfig, MAX_RETRY_ATTEMPTS};
pub use scheduler::{FetchScheduler, ProximityHandle, SchedulePhase};
pub use source::{HttpPageSource, InMemoryFeedSource};
