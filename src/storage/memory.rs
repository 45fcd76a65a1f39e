// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory backends.
//!
//! - [`InMemoryCache`]: a [`CacheClient`] with Redis semantics for the
//!   commands the cache layer uses, including key expiry.
//! - [`InMemorySummaryStore`]: a [`SummaryStore`] holding videos and tag
//!   links in process memory.
//!
//! Both are used for embedded deployments and tests.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;

use super::traits::{
    CacheBatch, CacheClient, CacheOp, FlushOutcome, StorageError, StorePage, SummaryStore,
    ViewIncrement,
};
use crate::video::{StoredVideo, VideoSummary, ViewerClass};

#[derive(Debug, Clone)]
enum Value {
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
    SortedSet(HashMap<String, f64>),
    List(VecDeque<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
            Value::SortedSet(_) => "zset",
            Value::List(_) => "list",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Value::Set(s) => s.is_empty(),
            Value::Hash(h) => h.is_empty(),
            Value::SortedSet(z) => z.is_empty(),
            Value::List(l) => l.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self { value, expires_at: None }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str, found: &Value) -> StorageError {
    StorageError::Backend(format!(
        "WRONGTYPE operation against key '{}' holding a {}",
        key,
        found.type_name()
    ))
}

pub struct InMemoryCache {
    data: DashMap<String, Entry>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Remaining time to live, `None` for missing or persistent keys.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.data
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Members of a set key, sorted (inspection helper).
    #[must_use]
    pub fn set_members(&self, key: &str) -> BTreeSet<String> {
        match self.live(key).map(|e| e.value) {
            Some(Value::Set(s)) => s.into_iter().collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Score of a sorted-set member (inspection helper).
    #[must_use]
    pub fn sorted_set_score(&self, key: &str, member: &str) -> Option<f64> {
        match self.live(key).map(|e| e.value) {
            Some(Value::SortedSet(z)) => z.get(member).copied(),
            _ => None,
        }
    }

    /// Force a key to expire now (simulates TTL lapse in tests).
    pub fn expire_now(&self, key: &str) {
        self.data.remove(key);
    }

    /// Clone of a live entry; expired entries are dropped on the way.
    fn live(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entry = self.data.get(key).map(|e| e.value().clone())?;
        if entry.is_expired(now) {
            self.data.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }

    /// Run `f` against the live entry for `key`, creating it with `init` if
    /// absent. Keys left empty are removed, as Redis does.
    fn mutate<T>(
        &self,
        key: &str,
        init: impl Fn() -> Value,
        f: impl FnOnce(&mut Value) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let now = Instant::now();
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| Entry::new(init()));
        if entry.is_expired(now) {
            *entry = Entry::new(init());
        }
        let result = f(&mut entry.value);
        let empty = entry.value.is_empty();
        drop(entry);
        if empty {
            self.data.remove_if(key, |_, e| e.value.is_empty());
        }
        result
    }

    fn apply(&self, op: &CacheOp) -> Result<(), StorageError> {
        match op {
            CacheOp::HashSet { key, fields } => self.mutate(key, || Value::Hash(HashMap::new()), |v| match v {
                Value::Hash(h) => {
                    for (field, value) in fields {
                        h.insert(field.clone(), value.clone());
                    }
                    Ok(())
                }
                other => Err(wrong_type(key, other)),
            }),
            CacheOp::HashIncr { key, field, delta } => self.mutate(key, || Value::Hash(HashMap::new()), |v| match v {
                Value::Hash(h) => {
                    let current = match h.get(field) {
                        Some(raw) => raw.parse::<i64>().map_err(|_| {
                            StorageError::Backend("ERR hash value is not an integer".into())
                        })?,
                        None => 0,
                    };
                    h.insert(field.clone(), (current + delta).to_string());
                    Ok(())
                }
                other => Err(wrong_type(key, other)),
            }),
            CacheOp::SetAdd { key, members } => self.mutate(key, || Value::Set(HashSet::new()), |v| match v {
                Value::Set(s) => {
                    s.extend(members.iter().cloned());
                    Ok(())
                }
                other => Err(wrong_type(key, other)),
            }),
            CacheOp::SetRemove { key, members } => {
                if self.live(key).is_none() {
                    return Ok(());
                }
                self.mutate(key, || Value::Set(HashSet::new()), |v| match v {
                    Value::Set(s) => {
                        for m in members {
                            s.remove(m);
                        }
                        Ok(())
                    }
                    other => Err(wrong_type(key, other)),
                })
            }
            CacheOp::SortedSetIncr { key, member, delta } => {
                self.mutate(key, || Value::SortedSet(HashMap::new()), |v| match v {
                    Value::SortedSet(z) => {
                        *z.entry(member.clone()).or_insert(0.0) += delta;
                        Ok(())
                    }
                    other => Err(wrong_type(key, other)),
                })
            }
            CacheOp::SortedSetRemove { key, member } => {
                if self.live(key).is_none() {
                    return Ok(());
                }
                self.mutate(key, || Value::SortedSet(HashMap::new()), |v| match v {
                    Value::SortedSet(z) => {
                        z.remove(member);
                        Ok(())
                    }
                    other => Err(wrong_type(key, other)),
                })
            }
            CacheOp::Delete { key } => {
                self.data.remove(key);
                Ok(())
            }
            CacheOp::Expire { key, ttl_secs } => {
                if self.live(key).is_some() {
                    if let Some(mut entry) = self.data.get_mut(key) {
                        entry.expires_at = Some(Instant::now() + Duration::from_secs(*ttl_secs));
                    }
                }
                Ok(())
            }
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheClient for InMemoryCache {
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn exec_batch(&self, batch: &CacheBatch) -> Result<(), StorageError> {
        for op in batch.ops() {
            self.apply(op)?;
        }
        Ok(())
    }

    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>, StorageError> {
        let mut union = HashSet::new();
        for key in keys {
            match self.live(key).map(|e| e.value) {
                Some(Value::Set(s)) => union.extend(s),
                Some(other) => return Err(wrong_type(key, &other)),
                None => {}
            }
        }
        Ok(union.into_iter().collect())
    }

    async fn hash_get_all_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>, StorageError> {
        keys.iter()
            .map(|key| match self.live(key).map(|e| e.value) {
                Some(Value::Hash(h)) => Ok(h),
                Some(other) => Err(wrong_type(key, &other)),
                None => Ok(HashMap::new()),
            })
            .collect()
    }

    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StorageError> {
        self.mutate(key, || Value::Hash(HashMap::new()), |v| match v {
            Value::Hash(h) => {
                if h.contains_key(field) {
                    Ok(false)
                } else {
                    h.insert(field.to_string(), value.to_string());
                    Ok(true)
                }
            }
            other => Err(wrong_type(key, other)),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.live(key).is_some())
    }

    async fn rename_nx(&self, from: &str, to: &str) -> Result<bool, StorageError> {
        if self.live(to).is_some() {
            return Ok(false);
        }
        match self.data.remove(from) {
            Some((_, entry)) if !entry.is_expired(Instant::now()) => {
                self.data.insert(to.to_string(), entry);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn sorted_set_top(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, StorageError> {
        match self.live(key).map(|e| e.value) {
            Some(Value::SortedSet(z)) => {
                let mut ranked: Vec<(String, f64)> = z.into_iter().collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
                ranked.truncate(limit);
                Ok(ranked)
            }
            Some(other) => Err(wrong_type(key, &other)),
            None => Ok(vec![]),
        }
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.mutate(key, || Value::List(VecDeque::new()), |v| match v {
            Value::List(l) => {
                l.push_back(value.to_string());
                Ok(())
            }
            other => Err(wrong_type(key, other)),
        })
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.live(key).is_none() {
            return Ok(None);
        }
        self.mutate(key, || Value::List(VecDeque::new()), |v| match v {
            Value::List(l) => Ok(l.pop_front()),
            other => Err(wrong_type(key, other)),
        })
    }

    async fn list_len(&self, key: &str) -> Result<u64, StorageError> {
        match self.live(key).map(|e| e.value) {
            Some(Value::List(l)) => Ok(l.len() as u64),
            Some(other) => Err(wrong_type(key, &other)),
            None => Ok(0),
        }
    }
}

#[derive(Default)]
struct StoreState {
    tags: BTreeSet<u64>,
    videos: HashMap<u64, StoredVideo>,
    applied_batches: HashMap<String, Instant>,
}

/// In-process store of record.
pub struct InMemorySummaryStore {
    state: RwLock<StoreState>,
}

impl InMemorySummaryStore {
    #[must_use]
    pub fn new() -> Self {
        Self { state: RwLock::new(StoreState::default()) }
    }

    pub fn add_tag(&self, tag_id: u64) {
        self.state.write().tags.insert(tag_id);
    }

    pub fn remove_tag(&self, tag_id: u64) {
        let mut state = self.state.write();
        state.tags.remove(&tag_id);
        for video in state.videos.values_mut() {
            video.tag_ids.retain(|t| *t != tag_id);
        }
    }

    /// Insert or replace a video; its tags are registered too.
    pub fn upsert_video(&self, video: StoredVideo) {
        let mut state = self.state.write();
        state.tags.extend(video.tag_ids.iter().copied());
        state.videos.insert(video.summary.id, video);
    }

    /// Mutate a stored video in place. Returns false if it does not exist.
    pub fn update_video(&self, video_id: u64, f: impl FnOnce(&mut StoredVideo)) -> bool {
        let mut state = self.state.write();
        let Some(video) = state.videos.get_mut(&video_id) else {
            return false;
        };
        f(video);
        let tags: Vec<u64> = video.tag_ids.clone();
        state.tags.extend(tags);
        true
    }

    /// Hard delete.
    pub fn remove_video(&self, video_id: u64) {
        self.state.write().videos.remove(&video_id);
    }

    /// Durable (member, non-member) counters.
    #[must_use]
    pub fn view_counts(&self, video_id: u64) -> Option<(u64, u64)> {
        self.state
            .read()
            .videos
            .get(&video_id)
            .map(|v| (v.views_member, v.views_non_member))
    }

    fn page(mut videos: Vec<VideoSummary>, offset: usize, limit: usize) -> StorePage {
        let total = videos.len() as u64;
        videos.shuffle(&mut rand::thread_rng());
        let videos = videos.into_iter().skip(offset).take(limit).collect();
        StorePage { videos, total }
    }
}

impl Default for InMemorySummaryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SummaryStore for InMemorySummaryStore {
    async fn list_tag_ids(&self) -> Result<Vec<u64>, StorageError> {
        Ok(self.state.read().tags.iter().copied().collect())
    }

    async fn find_videos_by_tag_eligible(&self, tag_id: u64) -> Result<Vec<u64>, StorageError> {
        let state = self.state.read();
        let mut ids: Vec<u64> = state
            .videos
            .values()
            .filter(|v| v.is_eligible() && v.tag_ids.contains(&tag_id))
            .map(|v| v.summary.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn find_video_summary(&self, video_id: u64) -> Result<Option<VideoSummary>, StorageError> {
        Ok(self
            .state
            .read()
            .videos
            .get(&video_id)
            .filter(|v| !v.is_deleted)
            .map(StoredVideo::to_summary))
    }

    async fn find_tag_ids_for_video(&self, video_id: u64) -> Result<Vec<u64>, StorageError> {
        Ok(self
            .state
            .read()
            .videos
            .get(&video_id)
            .map(|v| v.tag_ids.clone())
            .unwrap_or_default())
    }

    async fn apply_view_increments(
        &self,
        batch_id: &str,
        increments: &[ViewIncrement],
    ) -> Result<FlushOutcome, StorageError> {
        let mut state = self.state.write();
        if !batch_id.is_empty() {
            if state.applied_batches.contains_key(batch_id) {
                return Ok(FlushOutcome::AlreadyApplied);
            }
            state.applied_batches.insert(batch_id.to_string(), Instant::now());
        }
        for inc in increments {
            if let Some(video) = state.videos.get_mut(&inc.video_id) {
                video.views_member += inc.member;
                video.views_non_member += inc.non_member;
            }
        }
        Ok(FlushOutcome::Applied)
    }

    async fn prune_flush_batches(&self, retention: Duration) -> Result<u64, StorageError> {
        let mut state = self.state.write();
        let before = state.applied_batches.len();
        state.applied_batches.retain(|_, applied_at| applied_at.elapsed() < retention);
        Ok((before - state.applied_batches.len()) as u64)
    }

    async fn list_eligible_by_tags(
        &self,
        tag_ids: &[u64],
        offset: usize,
        limit: usize,
    ) -> Result<StorePage, StorageError> {
        let videos: Vec<VideoSummary> = self
            .state
            .read()
            .videos
            .values()
            .filter(|v| v.is_eligible() && v.tag_ids.iter().any(|t| tag_ids.contains(t)))
            .map(StoredVideo::to_summary)
            .collect();
        Ok(Self::page(videos, offset, limit))
    }

    async fn list_eligible(&self, offset: usize, limit: usize) -> Result<StorePage, StorageError> {
        let videos: Vec<VideoSummary> = self
            .state
            .read()
            .videos
            .values()
            .filter(|v| v.is_eligible())
            .map(StoredVideo::to_summary)
            .collect();
        Ok(Self::page(videos, offset, limit))
    }

    async fn increment_view_direct(&self, video_id: u64, class: ViewerClass) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let video = state.videos.get_mut(&video_id).ok_or(StorageError::NotFound)?;
        match class {
            ViewerClass::Member => video.views_member += 1,
            ViewerClass::NonMember => video.views_non_member += 1,
        }
        Ok(())
    }
}
