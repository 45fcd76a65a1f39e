// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Eviction and the durable retry queue.
//!
//! An eviction is one batch: delete the summary record, drop the video from
//! the popularity ledger, remove it from every named tag index. If the batch
//! fails the video id is pushed onto `cleanup:queue`, which lives in the
//! cache server and therefore survives process restarts. A deleted tag's
//! index that could not be dropped is queued the same way.
//!
//! # Job format
//!
//! ```text
//! evict:{video_id}                  first retry (one failed attempt so far)
//! evict:{video_id}:{attempts}       after further failures
//! evict-tag:{tag_id}[:{attempts}]   drop a deleted tag's index
//! ```
//!
//! The cleanup worker always re-reads tag membership from the store of
//! record. Jobs that reach `max_eviction_attempts` go to `cleanup:dead`.

use std::fmt;

use tracing::{debug, error, warn};

use super::types::CleanupReport;
use super::VideoCache;
use crate::keys;
use crate::storage::traits::{CacheBatch, CacheClient, StorageError};

const VIDEO_JOB_PREFIX: &str = "evict:";
const TAG_JOB_PREFIX: &str = "evict-tag:";

/// What a queued eviction removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionTarget {
    /// A video's record, ranking and tag memberships
    Video(u64),
    /// A deleted tag's whole index
    TagIndex(u64),
}

impl EvictionTarget {
    fn prefix(self) -> &'static str {
        match self {
            Self::Video(_) => VIDEO_JOB_PREFIX,
            Self::TagIndex(_) => TAG_JOB_PREFIX,
        }
    }

    fn id(self) -> u64 {
        match self {
            Self::Video(id) | Self::TagIndex(id) => id,
        }
    }
}

/// A queued eviction retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionJob {
    pub target: EvictionTarget,
    /// Failed attempts so far (at least 1)
    pub attempts: u32,
}

impl EvictionJob {
    /// The job queued after the inline eviction of a video failed.
    #[must_use]
    pub fn first(video_id: u64) -> Self {
        Self { target: EvictionTarget::Video(video_id), attempts: 1 }
    }

    /// The job queued after a deleted tag's index could not be dropped.
    #[must_use]
    pub fn first_tag(tag_id: u64) -> Self {
        Self { target: EvictionTarget::TagIndex(tag_id), attempts: 1 }
    }

    #[must_use]
    pub fn next_attempt(self) -> Self {
        Self { attempts: self.attempts.saturating_add(1), ..self }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        let (prefix, id) = (self.target.prefix(), self.target.id());
        if self.attempts <= 1 {
            format!("{}{}", prefix, id)
        } else {
            format!("{}{}:{}", prefix, id, self.attempts)
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (target, rest): (fn(u64) -> EvictionTarget, &str) = if let Some(rest) = raw.strip_prefix(TAG_JOB_PREFIX) {
            (EvictionTarget::TagIndex, rest)
        } else {
            (EvictionTarget::Video, raw.strip_prefix(VIDEO_JOB_PREFIX)?)
        };
        let (id, attempts) = match rest.split_once(':') {
            None => (rest.parse().ok()?, 1),
            Some((id, attempts)) => (id.parse().ok()?, attempts.parse::<u32>().ok()?.max(1)),
        };
        Some(Self { target: target(id), attempts })
    }
}

impl fmt::Display for EvictionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl VideoCache {
    fn eviction_batch(video_id: u64, tag_ids: &[u64]) -> CacheBatch {
        let member = video_id.to_string();
        let mut batch = CacheBatch::new();
        batch.del(keys::video(video_id)).zrem(keys::POPULAR, member.clone());
        for tag_id in tag_ids {
            batch.srem(keys::tag(*tag_id), vec![member.clone()]);
        }
        batch
    }

    /// Push a job onto the retry queue. If even that fails the removal is
    /// lost until TTL expiry or the next warm-up.
    async fn enqueue_eviction(&self, cache: &dyn CacheClient, job: EvictionJob) {
        match cache.list_push_back(keys::CLEANUP_QUEUE, &job.encode()).await {
            Ok(()) => crate::metrics::record_eviction("queued"),
            Err(e) => {
                error!(job = %job, error = %e, "Failed to queue eviction retry, stale entries remain until TTL");
                crate::metrics::record_eviction("lost");
            }
        }
    }

    /// Remove a video from the cache. Never fails: on error the eviction is
    /// queued for the cleanup worker.
    pub async fn evict_video(&self, video_id: u64, tag_ids: &[u64]) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };

        match cache.exec_batch(&Self::eviction_batch(video_id, tag_ids)).await {
            Ok(()) => crate::metrics::record_eviction("ok"),
            Err(e) => {
                warn!(video_id, error = %e, "Failed to evict video, queuing for retry");
                self.enqueue_eviction(cache.as_ref(), EvictionJob::first(video_id)).await;
            }
        }
    }

    /// Evict many videos; each one fails and queues independently.
    pub async fn evict_videos(&self, videos: &[(u64, Vec<u64>)]) {
        for (video_id, tag_ids) in videos {
            self.evict_video(*video_id, tag_ids).await;
        }
    }

    /// Drop a deleted tag's index and evict every video that carried it.
    ///
    /// Each video's remaining tags come from the store; the deleted tag is
    /// added so the video is removed from every index it may still be in.
    #[tracing::instrument(skip(self, affected_video_ids), fields(videos = affected_video_ids.len()))]
    pub async fn evict_tag(&self, tag_id: u64, affected_video_ids: &[u64]) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };

        if let Err(e) = cache.delete(&keys::tag(tag_id)).await {
            warn!(tag_id, error = %e, "Failed to delete tag index, queuing for retry");
            crate::metrics::record_error("evict", "tag_delete");
            self.enqueue_eviction(cache.as_ref(), EvictionJob::first_tag(tag_id)).await;
        }

        for video_id in affected_video_ids {
            match self.store.find_tag_ids_for_video(*video_id).await {
                Ok(mut tags) => {
                    if !tags.contains(&tag_id) {
                        tags.push(tag_id);
                    }
                    self.evict_video(*video_id, &tags).await;
                }
                Err(e) => {
                    warn!(video_id, error = %e, "Tag lookup failed, queuing eviction");
                    self.enqueue_eviction(cache.as_ref(), EvictionJob::first(*video_id)).await;
                }
            }
        }
    }

    async fn retry_eviction(&self, cache: &dyn CacheClient, target: EvictionTarget) -> Result<(), StorageError> {
        match target {
            EvictionTarget::Video(video_id) => {
                let tags = self.store.find_tag_ids_for_video(video_id).await?;
                cache.exec_batch(&Self::eviction_batch(video_id, &tags)).await
            }
            EvictionTarget::TagIndex(tag_id) => cache.delete(&keys::tag(tag_id)).await,
        }
    }

    /// One cleanup tick.
    ///
    /// Pops jobs until the queue is empty, the per-tick cap is reached, or a
    /// job fails. A failed job goes back to the tail (or to the dead-letter
    /// list once it hits the retry cap) and ends the tick.
    #[tracing::instrument(skip(self))]
    pub async fn process_cleanup_queue(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let Some(cache) = self.cache.as_ref() else {
            return report;
        };
        let cache = cache.as_ref();
        let max_jobs = self.config.cleanup_max_jobs_per_tick.max(1);
        let max_attempts = self.config.max_eviction_attempts.max(1);

        while report.handled() < max_jobs {
            let raw = match cache.list_pop_front(keys::CLEANUP_QUEUE).await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to pop cleanup queue");
                    crate::metrics::record_error("cleanup", "pop");
                    break;
                }
            };

            let Some(job) = EvictionJob::parse(&raw) else {
                warn!(job = %raw, "Dropping malformed cleanup job");
                crate::metrics::record_cleanup_job("malformed");
                report.malformed += 1;
                continue;
            };

            match self.retry_eviction(cache, job.target).await {
                Ok(()) => {
                    debug!(job = %job, attempts = job.attempts, "Queued eviction completed");
                    crate::metrics::record_cleanup_job("ok");
                    report.completed += 1;
                }
                Err(e) => {
                    let next = job.next_attempt();
                    if next.attempts >= max_attempts {
                        error!(job = %job, attempts = next.attempts, error = %e, "Eviction retries exhausted, dead-lettering");
                        if let Err(push_err) = cache.list_push_back(keys::CLEANUP_DEAD, &next.encode()).await {
                            error!(job = %job, error = %push_err, "Failed to dead-letter eviction job");
                        }
                        crate::metrics::record_cleanup_job("dead");
                        report.dead_lettered += 1;
                    } else {
                        warn!(job = %job, attempts = next.attempts, error = %e, "Queued eviction failed, re-queuing");
                        if let Err(push_err) = cache.list_push_back(keys::CLEANUP_QUEUE, &next.encode()).await {
                            error!(job = %job, error = %push_err, "Failed to re-queue eviction job");
                            crate::metrics::record_eviction("lost");
                        }
                        crate::metrics::record_cleanup_job("requeued");
                        report.requeued += 1;
                    }
                    break;
                }
            }
        }

        if let Ok(len) = cache.list_len(keys::CLEANUP_QUEUE).await {
            crate::metrics::set_retry_queue_len(len);
        }
        report
    }

    /// Jobs waiting in the retry queue.
    pub async fn retry_queue_len(&self) -> Result<u64, StorageError> {
        match self.cache.as_ref() {
            Some(cache) => cache.list_len(keys::CLEANUP_QUEUE).await,
            None => Ok(0),
        }
    }

    /// Jobs that exhausted their retries.
    pub async fn dead_letter_len(&self) -> Result<u64, StorageError> {
        match self.cache.as_ref() {
            Some(cache) => cache.list_len(keys::CLEANUP_DEAD).await,
            None => Ok(0),
        }
    }
}
