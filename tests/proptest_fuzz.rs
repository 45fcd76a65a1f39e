//! Property-based tests (fuzzing) for the recommendation cache.
//!
//! Uses proptest to generate random/malformed cache contents and verify the
//! decoders never panic and the read path keeps its paging guarantees.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;

use reco_cache::keys;
use reco_cache::cache::decode_buffer;
use reco_cache::video::{buffer_field, parse_buffer_field, REQUIRED_FIELDS};
use reco_cache::{
    CacheBatch, CacheClient, CacheConfig, EvictionJob, InMemoryCache, InMemorySummaryStore, PageSource,
    VideoCache, VideoSummary, ViewerClass,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn viewer_class_strategy() -> impl Strategy<Value = ViewerClass> {
    prop_oneof![Just(ViewerClass::Member), Just(ViewerClass::NonMember)]
}

/// Buffer fields: mostly valid counters, some garbage, sometimes the batch marker.
fn buffer_entry_strategy() -> impl Strategy<Value = (String, String)> {
    prop_oneof![
        6 => (0u64..50, viewer_class_strategy(), -5i64..100)
            .prop_map(|(id, class, n)| (buffer_field(id, class), n.to_string())),
        2 => (".{0,12}", ".{0,6}"),
        1 => "[0-9a-f-]{36}".prop_map(|uuid| (keys::FLUSH_BATCH_FIELD.to_string(), uuid)),
    ]
}

/// Summary hashes with any subset of fields and arbitrary values.
fn summary_fields_strategy() -> impl Strategy<Value = HashMap<String, String>> {
    let field = prop_oneof![
        Just("id"), Just("title"), Just("video_url"), Just("duration"), Just("views"),
        Just("thumbnail"), Just("category_id"), Just("user_id"), Just("username"), Just("created_at"),
    ];
    prop::collection::hash_map(field.prop_map(String::from), ".{0,20}", 0..8)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

// =============================================================================
// Decoder Robustness
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn buffer_field_parser_never_panics(field in ".*") {
        let _ = parse_buffer_field(&field);
    }

    #[test]
    fn buffer_field_parses_back(id in any::<u64>(), class in viewer_class_strategy()) {
        prop_assert_eq!(parse_buffer_field(&buffer_field(id, class)), Some((id, class)));
    }

    #[test]
    fn eviction_job_parser_never_panics(raw in ".*") {
        let _ = EvictionJob::parse(&raw);
    }

    #[test]
    fn parsed_eviction_jobs_are_canonical(raw in "evict(-tag)?:[0-9]{1,6}(:[0-9]{1,3})?") {
        let job = EvictionJob::parse(&raw).expect("well-formed job");
        prop_assert!(job.attempts >= 1);
        prop_assert_eq!(EvictionJob::parse(&job.encode()), Some(job));
        prop_assert!(job.next_attempt().attempts > job.attempts);
    }

    #[test]
    fn decode_buffer_counts_only_valid_positive_fields(
        entries in prop::collection::vec(buffer_entry_strategy(), 0..40)
    ) {
        let fields: HashMap<String, String> = entries.into_iter().collect();
        let decoded = decode_buffer(&fields);

        let mut expected_total = 0u64;
        let mut expected_skipped = 0usize;
        for (field, value) in &fields {
            if field == keys::FLUSH_BATCH_FIELD {
                continue;
            }
            match (parse_buffer_field(field), value.parse::<i64>()) {
                (Some(_), Ok(n)) => expected_total += n.max(0) as u64,
                _ => expected_skipped += 1,
            }
        }
        prop_assert_eq!(decoded.total_views(), expected_total);
        prop_assert_eq!(decoded.skipped, expected_skipped);

        // One increment per video, ascending, none empty
        let ids: Vec<u64> = decoded.increments.iter().map(|i| i.video_id).collect();
        prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(decoded.increments.iter().all(|i| !i.is_zero()));
    }

    #[test]
    fn summary_decoder_requires_identity_fields(fields in summary_fields_strategy()) {
        let decoded = VideoSummary::from_fields(&fields);
        let complete = REQUIRED_FIELDS.iter().all(|f| fields.contains_key(*f))
            && fields["id"].parse::<u64>().is_ok();
        prop_assert_eq!(decoded.is_some(), complete);
        if let Some(summary) = decoded {
            prop_assert_eq!(&summary.title, &fields["title"]);
            prop_assert_eq!(&summary.video_url, &fields["video_url"]);
        }
    }
}

// =============================================================================
// Read Path Paging
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn cached_pages_are_bounded_and_distinct(
        tag_a in prop::collection::hash_set(1u64..200, 1..30),
        tag_b in prop::collection::hash_set(1u64..200, 0..30),
        offset in 0usize..70,
        limit in 1usize..25,
    ) {
        let rt = runtime();
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(InMemorySummaryStore::new());
        let videos = VideoCache::new(Some(cache.clone()), store, CacheConfig::default());

        let union: HashSet<u64> = tag_a.union(&tag_b).copied().collect();
        let page = rt.block_on(async {
            let mut batch = CacheBatch::new();
            batch
                .sadd(keys::tag(1), tag_a.iter().map(u64::to_string).collect())
                .sadd(keys::tag(2), tag_b.iter().map(u64::to_string).collect());
            for id in &union {
                batch.hset(keys::video(*id), VideoSummary::new(*id, "t", "u").to_fields());
            }
            cache.exec_batch(&batch).await.unwrap();
            videos.get_recommendations(&[1, 2], offset, limit).await
        });

        if offset >= union.len() {
            prop_assert!(page.is_none());
            return Ok(());
        }
        let page = page.expect("window inside a non-empty union is served from cache");
        prop_assert_eq!(page.source, PageSource::Cache);
        prop_assert_eq!(page.total, union.len() as u64);

        let expected_len = (union.len() - offset).min(limit);
        prop_assert_eq!(page.videos.len(), expected_len);

        let ids = page.ids();
        let distinct: HashSet<u64> = ids.iter().copied().collect();
        prop_assert_eq!(distinct.len(), ids.len());
        prop_assert!(distinct.is_subset(&union));
    }
}
