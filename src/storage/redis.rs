// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the cache layer.
//!
//! Maps [`CacheClient`] onto plain Redis data structures:
//! - tag indexes → SET (`SUNION` for multi-tag reads)
//! - video summaries → HASH (pipelined `HGETALL` for page hydration)
//! - popularity ledger → ZSET
//! - view buffer → HASH (`HINCRBY`, `RENAMENX` to snapshot)
//! - retry queue → LIST (`RPUSH` / `LPOP`)
//!
//! Mutation batches run as a MULTI/EXEC pipeline so a batch either lands as a
//! whole or reports an error.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, ErrorKind, Pipeline, RedisError};

use super::traits::{CacheBatch, CacheClient, CacheOp, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// `ERR no such key`, the reply RENAME and RENAMENX give for a missing source.
fn is_missing_source(error: &RedisError) -> bool {
    error.kind() == ErrorKind::ResponseError
        && error.code() == Some("ERR")
        && error.detail().map(str::trim) == Some("no such key")
}

pub struct RedisCache {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "reco:" → "reco:tag:7")
    prefix: String,
    /// Retry policy for idempotent reads
    read_retry: RetryConfig,
}

impl RedisCache {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix.
    ///
    /// ```rust,no_run
    /// # use reco_cache::storage::redis::RedisCache;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys become "reco:tag:7", "reco:video:12", ...
    /// let cache = RedisCache::with_prefix("redis://localhost", Some("reco:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            read_retry: RetryConfig::query(),
        })
    }

    /// Override the read retry policy.
    #[must_use]
    pub fn with_read_retry(mut self, config: RetryConfig) -> Self {
        self.read_retry = config;
        self
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// Translate a logical batch into an atomic pipeline.
    fn build_pipeline(&self, batch: &CacheBatch) -> Pipeline {
        let mut pipeline = pipe();
        pipeline.atomic();

        for op in batch.ops() {
            match op {
                CacheOp::HashSet { key, fields } => {
                    let c = pipeline.cmd("HSET").arg(self.prefixed_key(key));
                    for (field, value) in fields {
                        c.arg(field).arg(value);
                    }
                }
                CacheOp::HashIncr { key, field, delta } => {
                    pipeline.cmd("HINCRBY").arg(self.prefixed_key(key)).arg(field).arg(*delta);
                }
                CacheOp::SetAdd { key, members } => {
                    pipeline.cmd("SADD").arg(self.prefixed_key(key)).arg(members);
                }
                CacheOp::SetRemove { key, members } => {
                    pipeline.cmd("SREM").arg(self.prefixed_key(key)).arg(members);
                }
                CacheOp::SortedSetIncr { key, member, delta } => {
                    pipeline.cmd("ZINCRBY").arg(self.prefixed_key(key)).arg(*delta).arg(member);
                }
                CacheOp::SortedSetRemove { key, member } => {
                    pipeline.cmd("ZREM").arg(self.prefixed_key(key)).arg(member);
                }
                CacheOp::Delete { key } => {
                    pipeline.cmd("DEL").arg(self.prefixed_key(key));
                }
                CacheOp::Expire { key, ttl_secs } => {
                    pipeline.cmd("EXPIRE").arg(self.prefixed_key(key)).arg(*ttl_secs);
                }
            }
        }

        pipeline
    }
}

#[async_trait]
impl CacheClient for RedisCache {
    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn exec_batch(&self, batch: &CacheBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let pipeline = self.build_pipeline(batch);
        let mut conn = self.connection.clone();
        pipeline.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>, StorageError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.connection.clone();
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();

        retry("redis_sunion", &self.read_retry, || {
            let mut conn = conn.clone();
            let prefixed = prefixed.clone();
            async move {
                let members: Vec<String> = cmd("SUNION").arg(&prefixed).query_async(&mut conn).await?;
                Ok(members)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn hash_get_all_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>, StorageError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.connection.clone();
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();

        retry("redis_hgetall_many", &self.read_retry, || {
            let mut conn = conn.clone();
            let prefixed = prefixed.clone();
            async move {
                let mut pipeline = pipe();
                for key in &prefixed {
                    pipeline.cmd("HGETALL").arg(key);
                }
                let maps: Vec<HashMap<String, String>> = pipeline.query_async(&mut conn).await?;
                Ok(maps)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let written: bool = cmd("HSETNX")
            .arg(self.prefixed_key(key))
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(written)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        retry("redis_exists", &self.read_retry, || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let exists: bool = cmd("EXISTS").arg(&key).query_async(&mut conn).await?;
                Ok(exists)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn rename_nx(&self, from: &str, to: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<bool> = cmd("RENAMENX")
            .arg(self.prefixed_key(from))
            .arg(self.prefixed_key(to))
            .query_async(&mut conn)
            .await;

        match result {
            Ok(renamed) => Ok(renamed),
            // RENAMENX errors instead of returning 0 when the source is missing
            Err(e) if is_missing_source(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        cmd("DEL").arg(self.prefixed_key(key)).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn sorted_set_top(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, StorageError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);
        let stop = limit as isize - 1;

        retry("redis_zrevrange", &self.read_retry, || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let ranked: Vec<(String, f64)> = cmd("ZREVRANGE")
                    .arg(&key)
                    .arg(0)
                    .arg(stop)
                    .arg("WITHSCORES")
                    .query_async(&mut conn)
                    .await?;
                Ok(ranked)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        cmd("RPUSH").arg(self.prefixed_key(key)).arg(value).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = cmd("LPOP").arg(self.prefixed_key(key)).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn list_len(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let len: u64 = cmd("LLEN").arg(self.prefixed_key(key)).query_async(&mut conn).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(kind: ErrorKind, detail: &str) -> RedisError {
        RedisError::from((kind, "An error was signalled by the server", detail.to_string()))
    }

    #[test]
    fn test_missing_source_is_recognised_by_kind_and_detail() {
        assert!(is_missing_source(&server_error(ErrorKind::ResponseError, "no such key")));
    }

    #[test]
    fn test_other_errors_are_not_missing_source() {
        assert!(!is_missing_source(&server_error(ErrorKind::ResponseError, "wrong number of arguments")));
        // Same text under a different kind, e.g. a script error message
        assert!(!is_missing_source(&server_error(ErrorKind::NoScriptError, "no such key")));
        assert!(!is_missing_source(&RedisError::from((ErrorKind::IoError, "connection reset"))));
    }
}
