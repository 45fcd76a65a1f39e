// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Startup warm-up and per-tag refill.
//!
//! Each tag index is replaced wholesale (DEL + SADD + EXPIRE in one batch),
//! so ids that became ineligible since the last run disappear instead of
//! lingering until TTL. Summary records are only written when missing or
//! incomplete.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{info, warn};

use super::types::WarmUpReport;
use super::VideoCache;
use crate::keys;
use crate::storage::traits::{CacheBatch, CacheClient, StorageError};
use crate::video::VideoSummary;

/// Ids checked and hydrated per round trip.
const HYDRATE_CHUNK: usize = 200;

impl VideoCache {
    /// Replace one tag index with the store's eligible set. Returns the ids.
    async fn rebuild_tag_index(&self, cache: &dyn CacheClient, tag_id: u64) -> Result<Vec<u64>, StorageError> {
        let ids = self.store.find_videos_by_tag_eligible(tag_id).await?;

        let tag_key = keys::tag(tag_id);
        let mut batch = CacheBatch::new();
        batch
            .del(tag_key.clone())
            .sadd(tag_key.clone(), ids.iter().map(u64::to_string).collect());
        if !ids.is_empty() {
            batch.expire(tag_key, self.config.tag_ttl_secs);
        }
        cache.exec_batch(&batch).await?;
        Ok(ids)
    }

    /// Write summary records for ids whose record is absent or incomplete.
    /// Returns how many were written.
    async fn hydrate_missing(&self, cache: &dyn CacheClient, ids: &[u64]) -> Result<usize, StorageError> {
        let mut hydrated = 0;

        for chunk in ids.chunks(HYDRATE_CHUNK) {
            let record_keys: Vec<String> = chunk.iter().map(|id| keys::video(*id)).collect();
            let records = cache.hash_get_all_many(&record_keys).await?;

            let mut batch = CacheBatch::new();
            let mut written = 0;
            for (video_id, record) in chunk.iter().zip(records.iter()) {
                if VideoSummary::from_fields(record).is_some() {
                    continue;
                }
                match self.store.find_video_summary(*video_id).await {
                    Ok(Some(summary)) => {
                        self.push_populate(&mut batch, &summary, &[]);
                        written += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(video_id, error = %e, "Failed to load summary for warm-up"),
                }
            }
            if !batch.is_empty() {
                cache.exec_batch(&batch).await?;
                hydrated += written;
            }
        }
        Ok(hydrated)
    }

    /// Rebuild one tag index and hydrate its missing summaries.
    /// Used for lazy refill after a store-served read.
    pub async fn refresh_tag(&self, tag_id: u64) -> Result<usize, StorageError> {
        let Some(cache) = self.cache.as_ref() else {
            return Ok(0);
        };
        let ids = self.rebuild_tag_index(cache.as_ref(), tag_id).await?;
        self.hydrate_missing(cache.as_ref(), &ids).await?;
        Ok(ids.len())
    }

    /// Load every tag index and the summaries they reference.
    ///
    /// Safe to run repeatedly. Without a reachable cache this is a no-op;
    /// a failing tag is logged and skipped.
    #[tracing::instrument(skip(self))]
    pub async fn warm_up(&self) -> WarmUpReport {
        let mut report = WarmUpReport::default();
        let Some(cache) = self.cache.as_ref() else {
            warn!("Cache warm-up skipped: no cache configured");
            return report;
        };
        let cache = cache.as_ref();
        if let Err(e) = cache.ping().await {
            warn!(error = %e, "Cache warm-up skipped: cache unreachable");
            return report;
        }

        let started = Instant::now();
        report.ran = true;

        let tags = match self.store.list_tag_ids().await {
            Ok(tags) => tags,
            Err(e) => {
                warn!(error = %e, "Cache warm-up: failed to list tags");
                return report;
            }
        };
        report.tags = tags.len();

        let mut videos = BTreeSet::new();
        for tag_id in tags {
            match self.rebuild_tag_index(cache, tag_id).await {
                Ok(ids) => {
                    if !ids.is_empty() {
                        report.indexed_tags += 1;
                    }
                    videos.extend(ids);
                }
                Err(e) => {
                    warn!(tag_id, error = %e, "Cache warm-up: failed to rebuild tag index");
                    report.failed_tags += 1;
                }
            }
        }

        let videos: Vec<u64> = videos.into_iter().collect();
        report.videos = videos.len();
        match self.hydrate_missing(cache, &videos).await {
            Ok(hydrated) => report.hydrated = hydrated,
            Err(e) => warn!(error = %e, "Cache warm-up: summary hydration incomplete"),
        }

        crate::metrics::record_warm_up(report.indexed_tags, report.videos, started.elapsed());
        info!(
            tags = report.tags,
            indexed = report.indexed_tags,
            videos = report.videos,
            hydrated = report.hydrated,
            failed = report.failed_tags,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cache warm-up complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::test_support::{fixture, stored, summary};
    use crate::config::CacheConfig;
    use crate::storage::memory::InMemorySummaryStore;

    #[tokio::test]
    async fn test_warm_up_indexes_only_eligible_videos() {
        let f = fixture();
        f.store.upsert_video(stored(1, vec![10, 11]));
        f.store.upsert_video(stored(2, vec![10]));
        let mut hidden = stored(3, vec![10]);
        hidden.is_hidden = true;
        f.store.upsert_video(hidden);

        let report = f.videos.warm_up().await;

        assert!(report.ran);
        assert_eq!(report.tags, 2);
        assert_eq!(report.indexed_tags, 2);
        assert_eq!(report.videos, 2);
        assert_eq!(report.hydrated, 2);
        assert_eq!(
            f.cache.set_members(&keys::tag(10)).into_iter().collect::<Vec<_>>(),
            vec!["1".to_string(), "2".to_string()]
        );
        assert!(!f.cache.exists(&keys::video(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_warm_up_is_idempotent() {
        let f = fixture();
        f.store.upsert_video(stored(1, vec![10]));

        f.videos.warm_up().await;
        let before = f.cache.len();
        let second = f.videos.warm_up().await;

        assert_eq!(second.hydrated, 0);
        assert_eq!(f.cache.len(), before);
        assert_eq!(f.cache.set_members(&keys::tag(10)).len(), 1);
    }

    #[tokio::test]
    async fn test_warm_up_drops_stale_members() {
        let f = fixture();
        f.videos.cache_video(&summary(99), &[10]).await;
        f.store.upsert_video(stored(1, vec![10]));

        f.videos.warm_up().await;

        let members = f.cache.set_members(&keys::tag(10));
        assert!(members.contains("1"));
        assert!(!members.contains("99"));
    }

    #[tokio::test]
    async fn test_warm_up_repairs_incomplete_records() {
        let f = fixture();
        f.store.upsert_video(stored(1, vec![10]));
        let mut batch = CacheBatch::new();
        batch.hset(keys::video(1), vec![("views".into(), "3".into())]);
        f.cache.exec_batch(&batch).await.unwrap();

        let report = f.videos.warm_up().await;

        assert_eq!(report.hydrated, 1);
        let record = f.cache.hash_get_all(&keys::video(1)).await.unwrap();
        assert!(VideoSummary::from_fields(&record).is_some());
    }

    #[tokio::test]
    async fn test_warm_up_without_cache_is_noop() {
        let bare = VideoCache::store_only(Arc::new(InMemorySummaryStore::new()), CacheConfig::default());
        assert_eq!(bare.warm_up().await, WarmUpReport::default());
    }
}
