// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background reconciliation workers.
//!
//! Two independent tasks, each on its own interval:
//!
//! - **flush**: drains the view buffer into the store ([`VideoCache::flush_views`])
//!   and prunes expired batch ids after a commit ([`VideoCache::prune_flush_ledger`])
//! - **cleanup**: retries queued evictions ([`VideoCache::process_cleanup_queue`])
//!
//! A tick runs to completion before the loop looks at the shutdown signal
//! again, so ticks never overlap and shutdown never cuts a batch in half.
//! The flush worker runs one last flush on the way out.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{FlushReport, VideoCache};

/// Handles to the running workers.
pub struct BackgroundWorkers {
    shutdown_tx: watch::Sender<bool>,
    flush: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

/// Start the flush and cleanup workers on the current runtime.
pub fn spawn_workers(videos: VideoCache) -> BackgroundWorkers {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flush_every = videos.config().flush_interval();
    let cleanup_every = videos.config().cleanup_interval();

    let flush = tokio::spawn(run_flush_worker(videos.clone(), flush_every, shutdown_rx.clone()));
    let cleanup = tokio::spawn(run_cleanup_worker(videos, cleanup_every, shutdown_rx));

    info!(?flush_every, ?cleanup_every, "Background workers started");
    BackgroundWorkers { shutdown_tx, flush, cleanup }
}

impl BackgroundWorkers {
    /// Signal both workers and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.flush.await {
            warn!(error = %e, "Flush worker ended abnormally");
        }
        if let Err(e) = self.cleanup.await {
            warn!(error = %e, "Cleanup worker ended abnormally");
        }
        info!("Background workers stopped");
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.flush.is_finished() && self.cleanup.is_finished()
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run_flush_worker(videos: VideoCache, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = ticker(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match videos.flush_views().await {
                    FlushReport::Applied { .. } => {
                        if let Err(e) = videos.prune_flush_ledger().await {
                            debug!(error = %e, "Flush ledger prune failed");
                        }
                    }
                    report @ FlushReport::Failed { .. } => debug!(?report, "Flush tick failed"),
                    _ => {}
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let report = videos.flush_views().await;
    info!(?report, "Final view flush on shutdown");
}

async fn run_cleanup_worker(videos: VideoCache, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = ticker(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = videos.process_cleanup_queue().await;
                if report.handled() > 0 {
                    debug!(?report, "Cleanup tick");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{fixture, stored, summary};
    use crate::config::CacheConfig;
    use crate::keys;
    use crate::storage::traits::CacheClient;
    use crate::video::ViewerClass;

    #[tokio::test(start_paused = true)]
    async fn test_workers_tick_on_their_intervals() {
        let f = fixture();
        f.store.upsert_video(stored(5, vec![1]));
        f.videos.cache_video(&summary(5), &[1]).await;
        f.videos.buffer_view(5, ViewerClass::Member).await;
        f.cache.list_push_back(keys::CLEANUP_QUEUE, "evict:5").await.unwrap();

        let videos = crate::cache::VideoCache::new(
            Some(f.cache.clone()),
            f.store.clone(),
            CacheConfig { flush_interval_secs: 30, cleanup_interval_secs: 10, ..Default::default() },
        );
        let workers = spawn_workers(videos);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!f.cache.exists(&keys::video(5)).await.unwrap());
        assert_eq!(f.store.view_counts(5), Some((0, 0)));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(f.store.view_counts(5), Some((1, 0)));

        workers.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_runs_final_flush() {
        let f = fixture();
        f.store.upsert_video(stored(5, vec![]));
        f.videos.buffer_view(5, ViewerClass::NonMember).await;

        let workers = spawn_workers(f.videos.clone());
        workers.shutdown().await;

        assert_eq!(f.store.view_counts(5), Some((0, 1)));
        assert!(!f.cache.exists(keys::VIEWS_BUFFER).await.unwrap());
    }
}
