// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The recommendation cache.
//!
//! [`VideoCache`] holds handles to the key-value cache and the store of
//! record and implements every cache operation on top of them. Its only
//! local state is the set of tag refills currently running. It is cheap to
//! clone, and clones share the backends and that set, so the workers and
//! request handlers each hold their own copy.
//!
//! # Layout
//!
//! ```text
//! reader.rs    get_recommendations / recommend   (union → shuffle → page → hydrate, refill on miss)
//! populate.rs  cache_video                       (HSET + SADD, with TTLs)
//! eviction.rs  evict_* / process_cleanup_queue   (batch removal + retry queue)
//! views.rs     buffer_view / flush_views / popular
//! warmup.rs    warm_up                           (rebuild tag indexes from the store)
//! ```
//!
//! Without a cache client every read is a miss and every cache write is a
//! no-op; [`VideoCache::recommend`] and [`VideoCache::record_view`] then go
//! straight to the store.

mod types;
mod reader;
mod populate;
mod eviction;
mod views;
mod warmup;

pub use types::{CleanupReport, FlushReport, PageSource, RecommendationPage, WarmUpReport};
pub use eviction::{EvictionJob, EvictionTarget};
pub use views::{decode_buffer, DecodedBuffer};

use std::sync::Arc;

use dashmap::DashSet;

use crate::config::CacheConfig;
use crate::storage::traits::{CacheClient, SummaryStore};

#[derive(Clone)]
pub struct VideoCache {
    pub(super) cache: Option<Arc<dyn CacheClient>>,
    pub(super) store: Arc<dyn SummaryStore>,
    pub(super) config: Arc<CacheConfig>,
    /// Tags with a background refill running
    pub(super) refills_in_flight: Arc<DashSet<u64>>,
}

impl VideoCache {
    pub fn new(cache: Option<Arc<dyn CacheClient>>, store: Arc<dyn SummaryStore>, config: CacheConfig) -> Self {
        Self { cache, store, config: Arc::new(config), refills_in_flight: Arc::new(DashSet::new()) }
    }

    /// A cache without a key-value backend (fallback-only mode).
    pub fn store_only(store: Arc<dyn SummaryStore>, config: CacheConfig) -> Self {
        Self::new(None, store, config)
    }

    #[must_use]
    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SummaryStore> {
        &self.store
    }

    pub fn cache_client(&self) -> Option<&Arc<dyn CacheClient>> {
        self.cache.as_ref()
    }
}
