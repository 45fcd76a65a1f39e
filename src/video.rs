// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Video summary data structure.
//!
//! A [`VideoSummary`] is the denormalized set of display fields cached once
//! per video and referenced by every tag index the video belongs to.
//!
//! # Example
//!
//! ```
//! use reco_cache::VideoSummary;
//!
//! let summary = VideoSummary::new(42, "Sourdough basics", "media/42.mp4");
//! let fields = summary.to_fields();
//! let map = fields.into_iter().collect();
//!
//! assert_eq!(VideoSummary::from_fields(&map), Some(summary));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fields a cached record must carry to be served.
pub const REQUIRED_FIELDS: [&str; 3] = ["id", "title", "video_url"];

/// Denormalized display fields for one video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub id: u64,
    pub title: String,
    /// Length in seconds
    pub duration: u32,
    /// Member + non-member views as of the last flush
    pub views: u64,
    pub thumbnail_url: String,
    pub category_id: u64,
    pub user_id: u64,
    pub video_url: String,
    /// Owner display name
    pub username: String,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
}

impl VideoSummary {
    /// Create a summary with the required fields; everything else zeroed.
    pub fn new(id: u64, title: impl Into<String>, video_url: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            duration: 0,
            views: 0,
            thumbnail_url: String::new(),
            category_id: 0,
            user_id: 0,
            video_url: video_url.into(),
            username: String::new(),
            created_at: 0,
        }
    }

    /// Flatten into hash fields for HSET.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".into(), self.id.to_string()),
            ("title".into(), self.title.clone()),
            ("duration".into(), self.duration.to_string()),
            ("views".into(), self.views.to_string()),
            ("thumbnail".into(), self.thumbnail_url.clone()),
            ("category_id".into(), self.category_id.to_string()),
            ("user_id".into(), self.user_id.to_string()),
            ("video_url".into(), self.video_url.clone()),
            ("username".into(), self.username.clone()),
            ("created_at".into(), self.created_at.to_string()),
        ]
    }

    /// Rebuild from an HGETALL result.
    ///
    /// Returns `None` for an absent or incomplete record (any of
    /// [`REQUIRED_FIELDS`] missing, or an unparsable `id`). Optional numeric
    /// fields fall back to zero.
    #[must_use]
    pub fn from_fields(map: &HashMap<String, String>) -> Option<Self> {
        if REQUIRED_FIELDS.iter().any(|f| !map.contains_key(*f)) {
            return None;
        }
        let id = map.get("id")?.parse::<u64>().ok()?;

        fn num<T: FromStr + Default>(map: &HashMap<String, String>, field: &str) -> T {
            map.get(field).and_then(|v| v.parse().ok()).unwrap_or_default()
        }
        let text = |field: &str| map.get(field).cloned().unwrap_or_default();

        Some(Self {
            id,
            title: text("title"),
            duration: num(map, "duration"),
            views: num(map, "views"),
            thumbnail_url: text("thumbnail"),
            category_id: num(map, "category_id"),
            user_id: num(map, "user_id"),
            video_url: text("video_url"),
            username: text("username"),
            created_at: num(map, "created_at"),
        })
    }
}

/// A full video row as the store of record holds it.
///
/// Used to seed stores; the cache layer only ever sees [`VideoSummary`].
#[derive(Debug, Clone)]
pub struct StoredVideo {
    pub summary: VideoSummary,
    pub views_member: u64,
    pub views_non_member: u64,
    pub is_published: bool,
    pub is_hidden: bool,
    pub is_deleted: bool,
    /// 0 = public, 1 = subscriber, 2 = premium
    pub access_tier: i8,
    pub tag_ids: Vec<u64>,
}

impl StoredVideo {
    /// A published, public, visible video.
    #[must_use]
    pub fn public(summary: VideoSummary, tag_ids: Vec<u64>) -> Self {
        Self {
            summary,
            views_member: 0,
            views_non_member: 0,
            is_published: true,
            is_hidden: false,
            is_deleted: false,
            access_tier: 0,
            tag_ids,
        }
    }

    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.is_published && !self.is_hidden && !self.is_deleted && self.access_tier == 0
    }

    /// Summary with `views` set to the combined durable counters.
    #[must_use]
    pub fn to_summary(&self) -> VideoSummary {
        let mut summary = self.summary.clone();
        summary.views = self.views_member + self.views_non_member;
        summary
    }
}

/// Who watched: channel members and everyone else are counted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerClass {
    Member,
    NonMember,
}

impl ViewerClass {
    #[must_use]
    pub fn from_is_member(is_member: bool) -> Self {
        if is_member { Self::Member } else { Self::NonMember }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::NonMember => "non_member",
        }
    }
}

impl fmt::Display for ViewerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewerClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Self::Member),
            "non_member" => Ok(Self::NonMember),
            other => Err(format!("unknown viewer class '{}'", other)),
        }
    }
}

/// Buffer hash field for a (video, class) bucket: `"{video_id}:{class}"`.
#[must_use]
pub fn buffer_field(video_id: u64, class: ViewerClass) -> String {
    format!("{}:{}", video_id, class)
}

/// Parse a buffer hash field back into its bucket.
#[must_use]
pub fn parse_buffer_field(field: &str) -> Option<(u64, ViewerClass)> {
    let (id, class) = field.split_once(':')?;
    Some((id.parse().ok()?, class.parse().ok()?))
}
