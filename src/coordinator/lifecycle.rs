// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service lifecycle: start and shutdown.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::cache::VideoCache;
use crate::storage::redis::RedisCache;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{CacheClient, StorageError, SummaryStore};
use crate::workers::spawn_workers;

use super::{CacheService, InjectedBackends, ServiceState};

impl CacheService {
    /// Connect backends, warm the cache, start the workers.
    ///
    /// Startup flow:
    /// 1. Connect the store of record (required)
    /// 2. Connect the cache (optional: on failure serve from the store only)
    /// 3. Warm up tag indexes and summaries
    /// 4. Spawn the flush and cleanup workers
    #[tracing::instrument(skip(self), fields(has_cache))]
    pub async fn start(&mut self) -> Result<(), StorageError> {
        if self.videos.is_some() {
            return Err(StorageError::Backend(format!("service already started (state {})", self.state())));
        }
        let startup_start = std::time::Instant::now();
        self.set_state(ServiceState::Connecting);

        let (cache, store) = match self.injected.take() {
            Some(InjectedBackends { cache, store }) => (cache, store),
            None => match self.connect_backends().await {
                Ok(backends) => backends,
                Err(e) => {
                    self.set_state(ServiceState::Created);
                    return Err(e);
                }
            },
        };
        tracing::Span::current().record("has_cache", cache.is_some());

        let videos = VideoCache::new(cache, store, self.config.clone());

        self.set_state(ServiceState::WarmingUp);
        let report = videos.warm_up().await;
        info!(ran = report.ran, tags = report.tags, videos = report.videos, "Warm-up finished");

        self.workers = Some(spawn_workers(videos.clone()));
        self.videos = Some(videos);
        self.set_state(ServiceState::Running);

        info!(elapsed_ms = startup_start.elapsed().as_millis() as u64, "Recommendation cache running");
        Ok(())
    }

    async fn connect_backends(&self) -> Result<(Option<Arc<dyn CacheClient>>, Arc<dyn SummaryStore>), StorageError> {
        let Some(sql_url) = self.config.sql_url.as_deref() else {
            error!("No SQL URL configured - the store of record is required");
            return Err(StorageError::Backend("sql_url is required".into()));
        };

        let store = match SqlStore::with_max_connections(sql_url, self.config.sql_max_connections).await {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, "Failed to connect to SQL");
                crate::metrics::set_backend_healthy("store", false);
                return Err(e);
            }
        };
        if self.config.sql_init_schema {
            store.ensure_schema().await?;
        }
        crate::metrics::set_backend_healthy("store", true);
        info!("Store of record connected");

        let cache: Option<Arc<dyn CacheClient>> = match self.config.redis_url.as_deref() {
            Some(redis_url) => {
                let prefix = Some(self.config.key_prefix.as_str()).filter(|p| !p.is_empty());
                match RedisCache::with_prefix(redis_url, prefix).await {
                    Ok(cache) => {
                        crate::metrics::set_backend_healthy("cache", true);
                        info!("Cache connected");
                        Some(Arc::new(cache) as Arc<dyn CacheClient>)
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to connect to cache, serving from the store only");
                        crate::metrics::set_backend_healthy("cache", false);
                        None
                    }
                }
            }
            None => {
                warn!("No cache URL configured, serving from the store only");
                None
            }
        };

        let store: Arc<dyn SummaryStore> = Arc::new(store);
        Ok((cache, store))
    }

    /// Stop the workers (the flush worker runs a final flush first).
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        info!("Initiating recommendation cache shutdown...");
        self.set_state(ServiceState::ShuttingDown);

        if let Some(workers) = self.workers.take() {
            workers.shutdown().await;
        }

        self.set_state(ServiceState::Stopped);
        info!("Recommendation cache shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::storage::memory::{InMemoryCache, InMemorySummaryStore};
    use crate::video::{StoredVideo, VideoSummary, ViewerClass};

    fn backends() -> (Arc<InMemoryCache>, Arc<InMemorySummaryStore>) {
        let store = Arc::new(InMemorySummaryStore::new());
        store.upsert_video(StoredVideo::public(VideoSummary::new(5, "five", "media/5.mp4"), vec![1]));
        (Arc::new(InMemoryCache::new()), store)
    }

    #[tokio::test]
    async fn test_start_warms_and_runs() {
        let (cache, store) = backends();
        let mut service = CacheService::with_backends(CacheConfig::default(), Some(cache.clone()), store);
        let mut states = service.state_receiver();

        service.start().await.unwrap();

        assert!(service.is_ready());
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ServiceState::Running);
        assert!(cache.set_members(&crate::keys::tag(1)).contains("5"));

        let health = service.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.cache_connected, Some(true));
        assert_eq!(health.retry_queue_len, Some(0));

        service.shutdown().await;
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffered_views() {
        let (cache, store) = backends();
        let mut service = CacheService::with_backends(CacheConfig::default(), Some(cache), store.clone());
        service.start().await.unwrap();

        service.videos().unwrap().record_view(5, ViewerClass::Member).await.unwrap();
        service.shutdown().await;

        assert_eq!(store.view_counts(5), Some((1, 0)));
    }

    #[tokio::test]
    async fn test_fallback_only_service() {
        let (_, store) = backends();
        let mut service = CacheService::with_backends(CacheConfig::default(), None, store);
        service.start().await.unwrap();

        let videos = service.videos().unwrap();
        assert!(!videos.has_cache());
        let page = videos.recommend(&[1], 0, 10).await.unwrap();
        assert_eq!(page.ids(), vec![5]);

        let health = service.health_check().await;
        assert!(health.healthy);
        assert!(!health.cache_configured);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_without_sql_url_fails() {
        let mut service = CacheService::new(CacheConfig::default());
        assert!(service.start().await.is_err());
        assert_eq!(service.state(), ServiceState::Created);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let (cache, store) = backends();
        let mut service = CacheService::with_backends(CacheConfig::default(), Some(cache), store);
        service.start().await.unwrap();
        assert!(service.start().await.is_err());
        service.shutdown().await;
    }
}
