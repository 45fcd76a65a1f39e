// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-behind view counting.
//!
//! Views land in the `views:buffer` hash (one HINCRBY per view) and in the
//! popularity ledger. The flush worker periodically moves the buffer into
//! the store of record:
//!
//! ```text
//! views:buffer ──RENAMENX──► views:flushing ──HSETNX batch=<uuid>
//!                                  │
//!                     decode → one store transaction (+ batch id)
//!                                  │
//!                              DEL views:flushing
//! ```
//!
//! Views that arrive mid-flush go into a fresh `views:buffer`. A snapshot
//! that survives a failed tick is picked up again by the next one with its
//! original batch id, and the store skips batch ids it has already recorded,
//! so a crash between commit and DEL cannot double count.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::FlushReport;
use super::VideoCache;
use crate::keys;
use crate::storage::traits::{CacheBatch, FlushOutcome, StorageError, ViewIncrement};
use crate::video::{buffer_field, parse_buffer_field, ViewerClass};

/// Per-video increments decoded from a buffer snapshot, ordered by video id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedBuffer {
    pub increments: Vec<ViewIncrement>,
    /// Fields that were neither the batch marker nor a valid counter
    pub skipped: usize,
}

impl DecodedBuffer {
    #[must_use]
    pub fn total_views(&self) -> u64 {
        self.increments.iter().map(ViewIncrement::total).sum()
    }
}

/// Decode a buffer hash into increments. Non-positive counts are dropped.
#[must_use]
pub fn decode_buffer(fields: &HashMap<String, String>) -> DecodedBuffer {
    let mut per_video: BTreeMap<u64, ViewIncrement> = BTreeMap::new();
    let mut skipped = 0;

    for (field, value) in fields {
        if field == keys::FLUSH_BATCH_FIELD {
            continue;
        }
        let (Some((video_id, class)), Ok(count)) = (parse_buffer_field(field), value.parse::<i64>()) else {
            skipped += 1;
            continue;
        };
        if count <= 0 {
            continue;
        }
        per_video
            .entry(video_id)
            .or_insert_with(|| ViewIncrement::new(video_id))
            .add(class, count as u64);
    }

    DecodedBuffer { increments: per_video.into_values().collect(), skipped }
}

fn flush_failed(stage: &'static str, error: impl std::fmt::Display) -> FlushReport {
    warn!(stage, error = %error, "View flush failed, snapshot retained");
    crate::metrics::record_flush_failure(stage);
    FlushReport::Failed { stage, error: error.to_string() }
}

impl VideoCache {
    /// Count one view in the buffer and bump the popularity ledger.
    /// Cache errors are logged and the view is dropped.
    pub async fn buffer_view(&self, video_id: u64, class: ViewerClass) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };

        let mut batch = CacheBatch::new();
        batch
            .hincr(keys::VIEWS_BUFFER, buffer_field(video_id, class), 1)
            .zincr(keys::POPULAR, video_id.to_string(), 1.0)
            .expire(keys::POPULAR, self.config.popular_ttl_secs);

        match cache.exec_batch(&batch).await {
            Ok(()) => crate::metrics::record_view(true),
            Err(e) => {
                warn!(video_id, %class, error = %e, "Failed to buffer view");
                crate::metrics::record_error("view", "buffer");
            }
        }
    }

    /// Buffer the view when a cache is attached, otherwise write it to the
    /// store directly.
    pub async fn record_view(&self, video_id: u64, class: ViewerClass) -> Result<(), StorageError> {
        if self.cache.is_some() {
            self.buffer_view(video_id, class).await;
            return Ok(());
        }
        self.store.increment_view_direct(video_id, class).await?;
        crate::metrics::record_view(false);
        Ok(())
    }

    /// One flush tick. See the module docs for the protocol.
    #[tracing::instrument(skip(self))]
    pub async fn flush_views(&self) -> FlushReport {
        let Some(cache) = self.cache.as_ref() else {
            return FlushReport::Idle;
        };
        let started = Instant::now();

        let resumed = match cache.exists(keys::VIEWS_FLUSHING).await {
            Ok(exists) => exists,
            Err(e) => return flush_failed("snapshot", e),
        };
        if !resumed {
            match cache.rename_nx(keys::VIEWS_BUFFER, keys::VIEWS_FLUSHING).await {
                Ok(true) => {}
                Ok(false) => return FlushReport::Idle,
                Err(e) => return flush_failed("snapshot", e),
            }
        }

        let candidate = Uuid::new_v4().to_string();
        if let Err(e) = cache.hash_set_nx(keys::VIEWS_FLUSHING, keys::FLUSH_BATCH_FIELD, &candidate).await {
            return flush_failed("stamp", e);
        }
        let fields = match cache.hash_get_all(keys::VIEWS_FLUSHING).await {
            Ok(fields) => fields,
            Err(e) => return flush_failed("read", e),
        };
        let batch_id = fields.get(keys::FLUSH_BATCH_FIELD).cloned().unwrap_or(candidate);

        let decoded = decode_buffer(&fields);
        if decoded.skipped > 0 {
            warn!(batch_id = %batch_id, skipped = decoded.skipped, "Skipped undecodable buffer fields");
        }

        let outcome = if decoded.increments.is_empty() {
            FlushOutcome::Applied
        } else {
            match self.store.apply_view_increments(&batch_id, &decoded.increments).await {
                Ok(outcome) => outcome,
                Err(e) => return flush_failed("apply", e),
            }
        };

        if let Err(e) = cache.delete(keys::VIEWS_FLUSHING).await {
            // Committed; the next tick sees the batch id as already applied.
            warn!(batch_id = %batch_id, error = %e, "Failed to clear flushed snapshot");
            crate::metrics::record_flush_failure("clear");
        }

        match outcome {
            FlushOutcome::Applied => {
                let views = decoded.total_views();
                let videos = decoded.increments.len();
                crate::metrics::record_flush(videos, views, started.elapsed());
                if resumed {
                    info!(batch_id = %batch_id, videos, views, "Resumed view flush committed");
                } else {
                    debug!(batch_id = %batch_id, videos, views, "View flush committed");
                }
                FlushReport::Applied { batch_id, videos, views, resumed }
            }
            FlushOutcome::AlreadyApplied => {
                info!(batch_id = %batch_id, "Snapshot was already committed, cleared without re-applying");
                FlushReport::AlreadyApplied { batch_id }
            }
        }
    }

    /// Drop batch ids older than the configured retention from the store's
    /// flush ledger.
    pub async fn prune_flush_ledger(&self) -> Result<u64, StorageError> {
        let retention = self.config.flush_batch_retention();
        let removed = self.store.prune_flush_batches(retention).await?;
        if removed > 0 {
            debug!(removed, ?retention, "Pruned flush batch ledger");
            crate::metrics::record_flush_batches_pruned(removed);
        }
        Ok(removed)
    }

    /// Highest-ranked videos from the popularity ledger, best first.
    pub async fn popular(&self, limit: usize) -> Result<Vec<(u64, f64)>, StorageError> {
        let Some(cache) = self.cache.as_ref() else {
            return Ok(vec![]);
        };
        let ranked = cache.sorted_set_top(keys::POPULAR, limit).await?;
        Ok(ranked
            .into_iter()
            .filter_map(|(member, score)| member.parse().ok().map(|id| (id, score)))
            .collect())
    }

    /// Views counted for a video but not yet in the store (buffer plus any
    /// snapshot mid-flush).
    pub async fn pending_views(&self, video_id: u64) -> Result<ViewIncrement, StorageError> {
        let mut pending = ViewIncrement::new(video_id);
        let Some(cache) = self.cache.as_ref() else {
            return Ok(pending);
        };

        let hashes = cache
            .hash_get_all_many(&[keys::VIEWS_BUFFER.to_string(), keys::VIEWS_FLUSHING.to_string()])
            .await?;
        for hash in &hashes {
            for class in [ViewerClass::Member, ViewerClass::NonMember] {
                let count = hash
                    .get(&buffer_field(video_id, class))
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                pending.add(class, count.max(0) as u64);
            }
        }
        Ok(pending)
    }
}
