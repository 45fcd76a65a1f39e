// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public result types for cache operations.

use crate::video::VideoSummary;

/// Which tier produced a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    Cache,
    Store,
}

impl std::fmt::Display for PageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cache => write!(f, "cache"),
            Self::Store => write!(f, "store"),
        }
    }
}

/// One page of recommendations.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationPage {
    /// Hydrated summaries in serving order (may be shorter than the limit)
    pub videos: Vec<VideoSummary>,
    /// Size of the deduplicated candidate set before paging
    pub total: u64,
    pub source: PageSource,
}

impl RecommendationPage {
    #[must_use]
    pub fn ids(&self) -> Vec<u64> {
        self.videos.iter().map(|v| v.id).collect()
    }
}

/// Outcome of one flush tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushReport {
    /// No cache, or nothing buffered.
    Idle,
    /// Increments committed and the snapshot cleared.
    Applied {
        batch_id: String,
        videos: usize,
        views: u64,
        /// The snapshot was left over from an earlier tick
        resumed: bool,
    },
    /// The batch had been committed by an earlier tick that failed before
    /// clearing the snapshot; the snapshot was cleared without re-applying.
    AlreadyApplied { batch_id: String },
    /// Something failed; the snapshot is retained for the next tick.
    Failed { stage: &'static str, error: String },
}

impl FlushReport {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Outcome of one cleanup tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Jobs whose eviction succeeded
    pub completed: usize,
    /// Jobs put back at the tail of the queue
    pub requeued: usize,
    /// Jobs moved to the dead-letter list
    pub dead_lettered: usize,
    /// Unparseable jobs dropped
    pub malformed: usize,
}

impl CleanupReport {
    #[must_use]
    pub fn handled(&self) -> usize {
        self.completed + self.requeued + self.dead_lettered + self.malformed
    }
}

/// Outcome of a warm-up run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmUpReport {
    /// False when there was no cache to warm
    pub ran: bool,
    pub tags: usize,
    /// Tag indexes written (non-empty)
    pub indexed_tags: usize,
    /// Distinct eligible videos across all tags
    pub videos: usize,
    /// Summary records written because they were missing
    pub hydrated: usize,
    /// Tags whose rebuild failed and were skipped
    pub failed_tags: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_source_display() {
        assert_eq!(PageSource::Cache.to_string(), "cache");
        assert_eq!(PageSource::Store.to_string(), "store");
    }

    #[test]
    fn test_cleanup_report_handled() {
        let report = CleanupReport { completed: 3, requeued: 1, dead_lettered: 1, malformed: 2 };
        assert_eq!(report.handled(), 7);
    }
}
