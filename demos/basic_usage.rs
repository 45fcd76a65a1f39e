// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic recommendation-cache usage example.
//!
//! Demonstrates:
//! 1. Seeding a SQLite store of record and connecting Redis
//! 2. Warm-up on start
//! 3. Serving pages from the cache (and from the store on a miss)
//! 4. Buffering views and flushing them
//! 5. Evicting a video
//! 6. Displaying metrics
//! 7. Clean shutdown (final flush)
//!
//! # Prerequisites
//!
//! A local Redis:
//! ```bash
//! docker run --rm -p 6379:6379 redis:7-alpine
//! ```
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use reco_cache::{CacheConfig, CacheService, SqlStore, StoredVideo, VideoSummary, ViewerClass};

const DB_PATH: &str = "./reco_cache_demo.db";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           reco-cache: Basic Usage Example                     ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Seed the store of record
    // ─────────────────────────────────────────────────────────────────────────
    let sql_url = format!("sqlite://{}?mode=rwc", DB_PATH);
    println!("📦 Seeding store at {}...", DB_PATH);

    let store = SqlStore::new(&sql_url).await?;
    store.ensure_schema().await?;
    let catalog = [
        (1, "Sourdough basics", vec![10, 11]),
        (2, "Knife skills", vec![10]),
        (3, "Espresso at home", vec![12]),
        (4, "Weeknight ramen", vec![10, 12]),
        (5, "Pie crust", vec![11]),
    ];
    for (id, title, tags) in &catalog {
        let mut summary = VideoSummary::new(*id, *title, format!("media/{}.mp4", id));
        summary.user_id = 1;
        summary.username = "chef".into();
        summary.duration = 300;
        store.upsert_video(&StoredVideo::public(summary, tags.clone())).await?;
        println!("   └─ {} {:?} tags={:?}", id, title, tags);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Configure and start (connect + warm-up + workers)
    // ─────────────────────────────────────────────────────────────────────────
    let config = CacheConfig {
        redis_url: Some("redis://localhost:6379".into()),
        sql_url: Some(sql_url.clone()),
        // Namespace prefix for Redis keys (plays nice with other data)
        key_prefix: "demo:".into(),
        flush_interval_secs: 1,
        ..Default::default()
    };
    let mut service = CacheService::new(config);
    println!("\n🚀 Starting service... State: {}", service.state());
    service.start().await?;
    println!("   ✅ State: {}", service.state());

    let videos = service.videos().ok_or("service not running")?;

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Recommendations
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Recommending for tags [10, 12] (page size 2)...");
    for offset in [0, 2, 4] {
        let start = std::time::Instant::now();
        let page = videos.recommend(&[10, 12], offset, 2).await?;
        println!(
            "   └─ offset {} → {:?} of {} from {} ({:?})",
            offset,
            page.ids(),
            page.total,
            page.source,
            start.elapsed()
        );
    }

    let page = videos.recommend(&[], 0, 3).await?;
    println!("   └─ no tags → {:?} of {} from {}", page.ids(), page.total, page.source);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Views
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n👀 Recording views...");
    for _ in 0..3 {
        videos.record_view(4, ViewerClass::NonMember).await?;
    }
    videos.record_view(4, ViewerClass::Member).await?;
    videos.record_view(1, ViewerClass::Member).await?;
    println!("   └─ pending for 4: {:?}", videos.pending_views(4).await?);
    println!("   └─ popular: {:?}", videos.popular(3).await?);

    let report = videos.flush_views().await;
    println!("   └─ flush: {:?}", report);
    println!("   └─ stored counts for 4: {:?}", store.view_counts(4).await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Eviction
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🗑️  Evicting video 4...");
    videos.evict_video(4, &[10, 12]).await;
    let page = videos.recommend(&[10, 12], 0, 10).await?;
    println!("   └─ tags [10, 12] → {:?} from {}", page.ids(), page.source);
    println!("   └─ retry queue: {}", videos.retry_queue_len().await?);

    let health = service.health_check().await;
    println!("\n🩺 Health: {:?}", health);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    service.shutdown().await;
    println!("   ✅ State: {}", service.state());

    for path in [DB_PATH.to_string(), format!("{}-shm", DB_PATH), format!("{}-wal", DB_PATH)] {
        let _ = std::fs::remove_file(path);
    }

    println!("\n💡 Cache keys remain in Redis - inspect with:");
    println!("   └─ redis-cli SMEMBERS demo:tag:10");
    println!("   └─ redis-cli HGETALL demo:video:1");
    println!("   └─ redis-cli ZREVRANGE demo:popular:global 0 -1 WITHSCORES");

    Ok(())
}

/// Dump all captured metrics, grouped by kind.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters = vec![];
    let mut gauges = vec![];
    let mut histograms = vec![];

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let name = format!("{}{}", key.name(), label_str);

        match value {
            DebugValue::Counter(v) => counters.push((name, v)),
            DebugValue::Gauge(v) => gauges.push((name, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, count, sum));
            }
        }
    }

    counters.sort();
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    println!("   ┌─ Counters");
    for (name, value) in &counters {
        println!("   │  └─ {} = {}", name, value);
    }
    println!("   ├─ Gauges");
    for (name, value) in &gauges {
        println!("   │  └─ {} = {:.2}", name, value);
    }
    println!("   └─ Histograms");
    for (name, count, sum) in &histograms {
        let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
        println!("      └─ {} count={} avg={:.4}", name, count, avg);
    }
}
