// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use tracing::warn;

use super::VideoCache;
use crate::keys;
use crate::storage::traits::CacheBatch;
use crate::video::VideoSummary;

impl VideoCache {
    /// Append the writes that cache one summary under its tags.
    pub(super) fn push_populate(&self, batch: &mut CacheBatch, summary: &VideoSummary, tag_ids: &[u64]) {
        let record_key = keys::video(summary.id);
        batch
            .hset(record_key.clone(), summary.to_fields())
            .expire(record_key, self.config.video_ttl_secs);

        let member = summary.id.to_string();
        for tag_id in tag_ids {
            let tag_key = keys::tag(*tag_id);
            batch
                .sadd(tag_key.clone(), vec![member.clone()])
                .expire(tag_key, self.config.tag_ttl_secs);
        }
    }

    /// Write a summary record and add the video to each tag index, in one
    /// round trip. Failures are logged and swallowed; the next warm-up or
    /// fallback refill repairs the gap.
    pub async fn cache_video(&self, summary: &VideoSummary, tag_ids: &[u64]) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };

        let mut batch = CacheBatch::new();
        self.push_populate(&mut batch, summary, tag_ids);

        if let Err(e) = cache.exec_batch(&batch).await {
            warn!(video_id = summary.id, error = %e, "Failed to cache video");
            crate::metrics::record_error("populate", "batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::cache::test_support::{fixture, summary};
    use crate::keys;
    use crate::storage::traits::CacheClient;
    use crate::video::VideoSummary;

    #[tokio::test]
    async fn test_cache_video_writes_record_and_indexes() {
        let f = fixture();
        f.videos.cache_video(&summary(42), &[3, 4]).await;

        let record = f.cache.hash_get_all(&keys::video(42)).await.unwrap();
        assert_eq!(VideoSummary::from_fields(&record), Some(summary(42)));
        assert!(f.cache.set_members(&keys::tag(3)).contains("42"));
        assert!(f.cache.set_members(&keys::tag(4)).contains("42"));
    }

    #[tokio::test]
    async fn test_cache_video_sets_independent_ttls() {
        let mut f = fixture();
        let mut config = f.videos.config().clone();
        config.video_ttl_secs = 120;
        config.tag_ttl_secs = 60;
        f.videos = crate::cache::VideoCache::new(Some(f.cache.clone()), f.store.clone(), config);

        f.videos.cache_video(&summary(1), &[9]).await;

        let record_ttl = f.cache.ttl(&keys::video(1)).unwrap();
        let tag_ttl = f.cache.ttl(&keys::tag(9)).unwrap();
        assert!(record_ttl > Duration::from_secs(100));
        assert!(tag_ttl <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_cache_video_without_tags_writes_only_record() {
        let f = fixture();
        f.videos.cache_video(&summary(7), &[]).await;

        assert!(f.cache.exists(&keys::video(7)).await.unwrap());
        assert_eq!(f.cache.len(), 1);
    }
}
