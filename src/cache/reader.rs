// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recommendation read path.
//!
//! The cache answer is random-ordered over the union of the requested tag
//! indexes. Pages are drawn from a fresh shuffle on every call, so paging is
//! "another random slice" rather than a stable cursor.

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use super::types::{PageSource, RecommendationPage};
use super::VideoCache;
use crate::keys;
use crate::storage::traits::StorageError;
use crate::video::VideoSummary;

/// Shuffle `ids` in place and return the `[offset, offset + limit)` window.
/// `None` when `offset` is at or past the end.
pub(crate) fn shuffle_page(ids: &mut [String], offset: usize, limit: usize) -> Option<&[String]> {
    ids.shuffle(&mut rand::thread_rng());
    if offset >= ids.len() {
        return None;
    }
    let end = offset.saturating_add(limit).min(ids.len());
    Some(&ids[offset..end])
}

impl VideoCache {
    /// Serve a page from the cache, or `None` for a miss.
    ///
    /// Misses are: no cache, no tags, empty union, an offset at or past the
    /// end of the union, nothing hydratable, or any cache error. A partially
    /// populated index can be shorter than the eligible set, so a window past
    /// its end goes to the store instead of answering with an empty page.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn get_recommendations(&self, tag_ids: &[u64], offset: usize, limit: usize) -> Option<RecommendationPage> {
        let cache = self.cache.as_ref()?;
        if tag_ids.is_empty() {
            return None;
        }

        let tag_keys: Vec<String> = tag_ids.iter().map(|t| keys::tag(*t)).collect();
        let mut members = match cache.set_union(&tag_keys).await {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, "Tag union failed, treating as miss");
                crate::metrics::record_error("read", "union");
                crate::metrics::record_cache_read("error");
                return None;
            }
        };
        if members.is_empty() {
            crate::metrics::record_cache_read("miss");
            return None;
        }

        let total = members.len() as u64;
        let Some(page) = shuffle_page(&mut members, offset, limit) else {
            debug!(offset, total, "Offset past the cached union");
            crate::metrics::record_cache_read("miss");
            return None;
        };

        let record_keys: Vec<String> = page.iter().map(|id| format!("{}{}", keys::VIDEO_PREFIX, id)).collect();
        let records = match cache.hash_get_all_many(&record_keys).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Summary hydration failed, treating as miss");
                crate::metrics::record_error("read", "hydrate");
                crate::metrics::record_cache_read("error");
                return None;
            }
        };

        let videos: Vec<VideoSummary> = records.iter().filter_map(VideoSummary::from_fields).collect();
        crate::metrics::record_hydration_skips(page.len() - videos.len());

        if videos.is_empty() {
            debug!(page = page.len(), "No summary in the page could be hydrated");
            crate::metrics::record_cache_read("miss");
            return None;
        }

        crate::metrics::record_cache_read("hit");
        Some(RecommendationPage { videos, total, source: PageSource::Cache })
    }

    /// Cache first, then the store of record.
    ///
    /// After a store-served page the requested tags are refilled in the
    /// background so the next request can hit. Only a store error surfaces.
    pub async fn recommend(&self, tag_ids: &[u64], offset: usize, limit: usize) -> Result<RecommendationPage, StorageError> {
        let _timer = crate::metrics::LatencyTimer::new("recommend");

        if let Some(page) = self.get_recommendations(tag_ids, offset, limit).await {
            return Ok(page);
        }

        let result = if tag_ids.is_empty() {
            self.store.list_eligible(offset, limit).await
        } else {
            self.store.list_eligible_by_tags(tag_ids, offset, limit).await
        };
        crate::metrics::record_fallback_read(result.is_ok());
        let page = result?;

        if self.cache.is_some() && !tag_ids.is_empty() {
            self.spawn_refill(tag_ids.to_vec());
        }

        Ok(RecommendationPage { videos: page.videos, total: page.total, source: PageSource::Store })
    }

    /// Rebuild the given tag indexes off the request path. A tag whose
    /// refill is already running is skipped.
    fn spawn_refill(&self, tag_ids: Vec<u64>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let claimed = self.claim_refills(&tag_ids);
        if claimed.is_empty() {
            return;
        }
        let this = self.clone();
        handle.spawn(async move {
            for tag_id in claimed {
                if let Err(e) = this.refresh_tag(tag_id).await {
                    debug!(tag_id, error = %e, "Lazy tag refill failed");
                }
                this.refills_in_flight.remove(&tag_id);
            }
        });
    }

    /// Mark tags as being refilled, returning those not already claimed.
    pub(crate) fn claim_refills(&self, tag_ids: &[u64]) -> Vec<u64> {
        tag_ids.iter().copied().filter(|tag_id| self.refills_in_flight.insert(*tag_id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::cache::test_support::{fixture, stored, summary};
    use crate::config::CacheConfig;
    use crate::storage::memory::InMemorySummaryStore;
    use crate::storage::traits::{CacheBatch, CacheClient};

    #[test]
    fn test_shuffle_page_window() {
        let mut ids: Vec<String> = (1..=5).map(|i| i.to_string()).collect();
        assert_eq!(shuffle_page(&mut ids, 0, 2).unwrap().len(), 2);
        assert_eq!(shuffle_page(&mut ids, 4, 10).unwrap().len(), 1);
        assert!(shuffle_page(&mut ids, 5, 10).is_none());
        assert!(shuffle_page(&mut ids, 0, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_union_paging_and_total() {
        let f = fixture();
        f.videos.cache_video(&summary(5), &[1]).await;
        f.videos.cache_video(&summary(9), &[1, 2]).await;
        f.videos.cache_video(&summary(12), &[2]).await;

        let page = f.videos.get_recommendations(&[1, 2], 0, 2).await.unwrap();
        assert_eq!(page.videos.len(), 2);
        assert_eq!(page.total, 3);
        assert_eq!(page.source, PageSource::Cache);
        let ids: HashSet<u64> = page.ids().into_iter().collect();
        assert!(ids.is_subset(&[5, 9, 12].into_iter().collect()));
    }

    #[tokio::test]
    async fn test_offset_past_end_is_miss() {
        let f = fixture();
        f.videos.cache_video(&summary(5), &[1]).await;

        assert!(f.videos.get_recommendations(&[1], 1, 10).await.is_none());
        assert!(f.videos.get_recommendations(&[1], 7, 10).await.is_none());
        assert!(f.videos.get_recommendations(&[1], 0, 10).await.is_some());
    }

    #[tokio::test]
    async fn test_partial_index_pages_past_end_from_store() {
        let f = fixture();
        for id in 1..=10 {
            f.store.upsert_video(stored(id, vec![1]));
        }
        // Only one member has made it into the index so far
        f.videos.cache_video(&summary(1), &[1]).await;

        let page = f.videos.recommend(&[1], 5, 5).await.unwrap();
        assert_eq!(page.source, PageSource::Store);
        assert_eq!(page.total, 10);
        assert_eq!(page.videos.len(), 5);
    }

    #[tokio::test]
    async fn test_refill_claims_are_single_flight() {
        let f = fixture();
        assert_eq!(f.videos.claim_refills(&[1, 2]), vec![1, 2]);
        assert_eq!(f.videos.claim_refills(&[2, 3]), vec![3]);
        // Clones share the in-flight set
        assert!(f.videos.clone().claim_refills(&[1]).is_empty());

        f.videos.refills_in_flight.remove(&2);
        assert_eq!(f.videos.claim_refills(&[2, 2]), vec![2]);
    }

    #[tokio::test]
    async fn test_missing_records_are_skipped() {
        let f = fixture();
        f.videos.cache_video(&summary(5), &[1]).await;
        let mut batch = CacheBatch::new();
        batch.sadd(crate::keys::tag(1), vec!["6".into(), "7".into()]);
        f.cache.exec_batch(&batch).await.unwrap();

        let page = f.videos.get_recommendations(&[1], 0, 10).await.unwrap();
        assert_eq!(page.ids(), vec![5]);
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn test_no_hydratable_records_is_miss() {
        let f = fixture();
        let mut batch = CacheBatch::new();
        batch
            .sadd(crate::keys::tag(1), vec!["6".into()])
            .hset(crate::keys::video(6), vec![("title".into(), "no id".into())]);
        f.cache.exec_batch(&batch).await.unwrap();

        assert!(f.videos.get_recommendations(&[1], 0, 10).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_inputs_are_misses() {
        let f = fixture();
        assert!(f.videos.get_recommendations(&[], 0, 10).await.is_none());
        assert!(f.videos.get_recommendations(&[404], 0, 10).await.is_none());

        let bare = VideoCache::store_only(Arc::new(InMemorySummaryStore::new()), CacheConfig::default());
        assert!(bare.get_recommendations(&[1], 0, 10).await.is_none());
    }

    #[tokio::test]
    async fn test_recommend_falls_back_to_store() {
        let f = fixture();
        f.store.upsert_video(stored(5, vec![1]));
        f.store.upsert_video(stored(9, vec![1]));

        let page = f.videos.recommend(&[1], 0, 10).await.unwrap();
        assert_eq!(page.source, PageSource::Store);
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_recommend_without_tags_lists_everything() {
        let f = fixture();
        f.store.upsert_video(stored(5, vec![1]));
        f.store.upsert_video(stored(6, vec![]));

        let page = f.videos.recommend(&[], 0, 10).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.source, PageSource::Store);
    }

    #[tokio::test]
    async fn test_fallback_refills_tag_index() {
        let f = fixture();
        f.store.upsert_video(stored(5, vec![1]));

        let first = f.videos.recommend(&[1], 0, 10).await.unwrap();
        assert_eq!(first.source, PageSource::Store);

        // The refill runs on a spawned task
        for _ in 0..50 {
            if f.videos.get_recommendations(&[1], 0, 10).await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let second = f.videos.recommend(&[1], 0, 10).await.unwrap();
        assert_eq!(second.source, PageSource::Cache);
        assert_eq!(second.ids(), vec![5]);

        // The claim is released once the refill finishes
        for _ in 0..50 {
            if f.videos.refills_in_flight.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(f.videos.claim_refills(&[1]), vec![1]);
    }
}
