//! Shared fixtures for feed-pagination integration tests
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use feed_pagination::{FeedConfig, FeedId, FeedItem, FlattenedView, InMemoryFeedSource, SortKey};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Once};
use uuid::Uuid;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "feed_pagination=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub body: String,
}

impl FeedItem for Post {
    fn sort_key(&self) -> SortKey {
        SortKey::new(self.created_at, self.id)
    }
}

/// Post `n` of a feed; higher `n` is newer
pub fn post(n: u128) -> Post {
    Post {
        id: Uuid::from_u128(n),
        created_at: Utc.timestamp_millis_opt(1_700_000_000_000 + n as i64 * 1000).unwrap(),
        body: format!("post {}", n),
    }
}

/// Same timestamp as `post(n)`, different id
pub fn twin(n: u128, id: u128) -> Post {
    Post {
        id: Uuid::from_u128(id),
        ..post(n)
    }
}

pub fn global() -> FeedId {
    FeedId::from("global")
}

pub fn seeded_source(count: u128) -> Arc<InMemoryFeedSource<Post>> {
    let source = Arc::new(InMemoryFeedSource::new());
    source.extend(&global(), (1..=count).map(post));
    source
}

pub fn config(page_size: u32) -> FeedConfig {
    FeedConfig {
        page_size,
        retry_attempts: 0,
        ..Default::default()
    }
}

/// Post numbers of a view, in display order
pub fn numbers(view: &FlattenedView<Post>) -> Vec<u128> {
    view.items.iter().map(|p| p.id.as_u128()).collect()
}

pub fn assert_feed_order(view: &FlattenedView<Post>) {
    for pair in view.items.windows(2) {
        assert!(
            pair[0].sort_key() > pair[1].sort_key(),
            "{:?} should sort before {:?}",
            pair[0].id,
            pair[1].id
        );
    }
}
