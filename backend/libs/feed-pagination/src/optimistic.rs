//! Optimistic item updates with snapshot rollback
//!
//! Used for actions like "like" or "bookmark" where the UI should reflect the
//! change before the server confirms it. The page holding the item is copied,
//! the item is swapped for its modified copy, and the copy is put back if the
//! request fails. Each swap is a compare-and-swap on that one item: inserts
//! elsewhere in the page don't block the rollback, but a reset, an eviction or
//! a newer update of the same item does, so newer state is never clobbered.

use std::future::Future;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::PagedCacheManager;
use crate::error::{FeedError, Result};
use crate::protocol::{FeedId, FeedItem, PageSource};

pub async fn apply_optimistic<T, S, F, Fut, R>(
    cache: &PagedCacheManager<T, S>,
    feed: &FeedId,
    item_id: Uuid,
    modify: F,
    request: Fut,
) -> Result<R>
where
    T: FeedItem + PartialEq,
    S: PageSource<T>,
    F: FnOnce(&T) -> T,
    Fut: Future<Output = Result<R>>,
{
    let snapshot = cache
        .snapshot_page(feed, item_id)
        .ok_or(FeedError::ItemNotCached(item_id))?;
    let original = snapshot
        .items()
        .iter()
        .find(|item| item.item_id() == item_id)
        .cloned()
        .ok_or(FeedError::ItemNotCached(item_id))?;

    let tentative = modify(&original);
    if tentative.sort_key() != original.sort_key() {
        return Err(FeedError::BadRequest(
            "optimistic update must not change the item's sort key".to_string(),
        ));
    }

    let applied = cache.compare_and_swap_item(feed, &snapshot, &original, tentative.clone());
    if applied {
        debug!(feed = %feed, item_id = %item_id, "Applied optimistic update");
        cache.notify_replaced(feed, item_id);
    }

    match request.await {
        Ok(response) => Ok(response),
        Err(e) => {
            if applied {
                if cache.compare_and_swap_item(feed, &snapshot, &tentative, original) {
                    debug!(feed = %feed, item_id = %item_id, error = %e, "Rolled back optimistic update");
                    cache.notify_replaced(feed, item_id);
                } else {
                    warn!(feed = %feed, item_id = %item_id, "Item replaced or evicted during optimistic update, not rolling back");
                }
            }
            Err(e)
        }
    }
}
