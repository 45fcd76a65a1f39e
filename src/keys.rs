// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Logical cache key layout.
//!
//! ```text
//! tag:{tag_id}      SET   video ids eligible under the tag      (TTL)
//! video:{video_id}  HASH  display fields                         (TTL)
//! popular:global    ZSET  video id → view tally                  (TTL)
//! views:buffer      HASH  "{video_id}:{class}" → pending count
//! views:flushing    HASH  buffer snapshot being flushed (+ "batch" id)
//! cleanup:queue     LIST  pending eviction jobs
//! cleanup:dead      LIST  eviction jobs past the retry cap
//! ```
//!
//! These are unprefixed; adapters apply `key_prefix` from config.

pub const TAG_PREFIX: &str = "tag:";
pub const VIDEO_PREFIX: &str = "video:";
pub const POPULAR: &str = "popular:global";
pub const VIEWS_BUFFER: &str = "views:buffer";
pub const VIEWS_FLUSHING: &str = "views:flushing";
pub const CLEANUP_QUEUE: &str = "cleanup:queue";
pub const CLEANUP_DEAD: &str = "cleanup:dead";

/// Field in the flushing snapshot holding its batch id.
pub const FLUSH_BATCH_FIELD: &str = "batch";

#[inline]
#[must_use]
pub fn tag(tag_id: u64) -> String {
    format!("{}{}", TAG_PREFIX, tag_id)
}

#[inline]
#[must_use]
pub fn video(video_id: u64) -> String {
    format!("{}{}", VIDEO_PREFIX, video_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(tag(7), "tag:7");
        assert_eq!(video(12), "video:12");
    }
}
