// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend capabilities consumed by the cache layer.
//!
//! - [`CacheClient`]: the volatile key-value accelerator (Redis in production)
//! - [`SummaryStore`]: the durable store of record (MySQL/SQLite in production)
//!
//! Both are injected as trait objects so every component receives its
//! backends explicitly and tests can swap in the in-memory adapters.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::video::{VideoSummary, ViewerClass};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Malformed cached data: {0}")]
    Decode(String),
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound,
            other => StorageError::Backend(other.to_string()),
        }
    }
}

/// A single cache mutation. Keys are logical (unprefixed); the adapter
/// applies its namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    HashSet { key: String, fields: Vec<(String, String)> },
    HashIncr { key: String, field: String, delta: i64 },
    SetAdd { key: String, members: Vec<String> },
    SetRemove { key: String, members: Vec<String> },
    SortedSetIncr { key: String, member: String, delta: f64 },
    SortedSetRemove { key: String, member: String },
    Delete { key: String },
    Expire { key: String, ttl_secs: u64 },
}

/// An ordered list of mutations sent in one round trip.
///
/// Redis executes it as a MULTI/EXEC pipeline, so either every op is applied
/// or the batch reports an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheBatch {
    ops: Vec<CacheOp>,
}

impl CacheBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hset(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        self.ops.push(CacheOp::HashSet { key: key.into(), fields });
        self
    }

    pub fn hincr(&mut self, key: impl Into<String>, field: impl Into<String>, delta: i64) -> &mut Self {
        self.ops.push(CacheOp::HashIncr { key: key.into(), field: field.into(), delta });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(CacheOp::SetAdd { key: key.into(), members });
        }
        self
    }

    pub fn srem(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(CacheOp::SetRemove { key: key.into(), members });
        }
        self
    }

    pub fn zincr(&mut self, key: impl Into<String>, member: impl Into<String>, delta: f64) -> &mut Self {
        self.ops.push(CacheOp::SortedSetIncr { key: key.into(), member: member.into(), delta });
        self
    }

    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(CacheOp::SortedSetRemove { key: key.into(), member: member.into() });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(CacheOp::Delete { key: key.into() });
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl_secs: u64) -> &mut Self {
        self.ops.push(CacheOp::Expire { key: key.into(), ttl_secs });
        self
    }

    #[must_use]
    pub fn ops(&self) -> &[CacheOp] {
        &self.ops
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The key-value cache capability.
///
/// Modelled on the handful of Redis data-structure commands the cache layer
/// needs. Implementations must be safe to share across tasks.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Round-trip health check.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Apply a batch of mutations in one round trip.
    async fn exec_batch(&self, batch: &CacheBatch) -> Result<(), StorageError>;

    /// Union of the members of every set key (SUNION). Missing keys count as empty.
    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>, StorageError>;

    /// HGETALL for many keys in one pipelined round trip.
    /// Missing keys yield an empty map at the matching position.
    async fn hash_get_all_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>, StorageError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        let mut all = self.hash_get_all_many(&[key.to_string()]).await?;
        Ok(all.pop().unwrap_or_default())
    }

    /// HSETNX. Returns true if the field was written.
    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Rename `from` to `to` only if `from` exists and `to` does not (RENAMENX).
    /// Returns true if the rename happened.
    async fn rename_nx(&self, from: &str, to: &str) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Highest-scored members, best first (ZREVRANGE ... WITHSCORES).
    async fn sorted_set_top(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, StorageError>;

    /// RPUSH.
    async fn list_push_back(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// LPOP. `None` when the list is empty or missing.
    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn list_len(&self, key: &str) -> Result<u64, StorageError>;
}

/// Pending view-count deltas for one video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewIncrement {
    pub video_id: u64,
    pub member: u64,
    pub non_member: u64,
}

impl ViewIncrement {
    #[must_use]
    pub fn new(video_id: u64) -> Self {
        Self { video_id, ..Default::default() }
    }

    pub fn add(&mut self, class: ViewerClass, count: u64) {
        match class {
            ViewerClass::Member => self.member += count,
            ViewerClass::NonMember => self.non_member += count,
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.member == 0 && self.non_member == 0
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.member + self.non_member
    }
}

/// Result of applying a flush batch to the store of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Increments committed in this call.
    Applied,
    /// The batch id was already recorded; nothing was applied again.
    AlreadyApplied,
}

/// A page read from the store of record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorePage {
    pub videos: Vec<VideoSummary>,
    pub total: u64,
}

/// The durable store of record.
///
/// "Eligible" always means: published, not hidden, not deleted, public
/// access tier.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn list_tag_ids(&self) -> Result<Vec<u64>, StorageError>;

    async fn find_videos_by_tag_eligible(&self, tag_id: u64) -> Result<Vec<u64>, StorageError>;

    /// Display fields for one video regardless of eligibility.
    /// `None` if the video does not exist.
    async fn find_video_summary(&self, video_id: u64) -> Result<Option<VideoSummary>, StorageError>;

    async fn find_tag_ids_for_video(&self, video_id: u64) -> Result<Vec<u64>, StorageError>;

    /// Add every increment to the durable counters in one transaction,
    /// recording `batch_id` in the same transaction.
    async fn apply_view_increments(
        &self,
        batch_id: &str,
        increments: &[ViewIncrement],
    ) -> Result<FlushOutcome, StorageError>;

    /// Forget batch ids recorded more than `retention` ago. Returns how many
    /// were removed. A batch id only has to outlive a stranded snapshot.
    async fn prune_flush_batches(&self, retention: Duration) -> Result<u64, StorageError>;

    /// Eligible videos carrying any of `tag_ids`, random order, deduplicated.
    async fn list_eligible_by_tags(
        &self,
        tag_ids: &[u64],
        offset: usize,
        limit: usize,
    ) -> Result<StorePage, StorageError>;

    /// Eligible videos regardless of tags, random order.
    async fn list_eligible(&self, offset: usize, limit: usize) -> Result<StorePage, StorageError>;

    /// Unbuffered single increment, used when no cache is attached.
    async fn increment_view_direct(&self, video_id: u64, class: ViewerClass) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_builder_skips_empty_member_lists() {
        let mut batch = CacheBatch::new();
        batch.sadd("tag:1", vec![]).srem("tag:2", vec![]).del("video:1");

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.ops()[0], CacheOp::Delete { key: "video:1".into() });
    }

    #[test]
    fn test_batch_preserves_order() {
        let mut batch = CacheBatch::new();
        batch
            .hset("video:9", vec![("id".into(), "9".into())])
            .expire("video:9", 60)
            .sadd("tag:3", vec!["9".into()]);

        let kinds: Vec<&str> = batch.ops().iter().map(|op| match op {
            CacheOp::HashSet { .. } => "hset",
            CacheOp::Expire { .. } => "expire",
            CacheOp::SetAdd { .. } => "sadd",
            _ => "other",
        }).collect();
        assert_eq!(kinds, vec!["hset", "expire", "sadd"]);
    }

    #[test]
    fn test_view_increment_accumulates_by_class() {
        let mut inc = ViewIncrement::new(5);
        assert!(inc.is_zero());

        inc.add(ViewerClass::Member, 3);
        inc.add(ViewerClass::NonMember, 1);
        inc.add(ViewerClass::Member, 2);

        assert_eq!(inc.member, 5);
        assert_eq!(inc.non_member, 1);
        assert_eq!(inc.total(), 6);
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: StorageError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StorageError::NotFound));
    }
}
