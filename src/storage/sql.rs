// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL store of record.
//!
//! Reads the tables the backend already owns and writes nothing but view
//! counters and the flush batch ledger (pruned after a retention window).
//! [`SqlStore::ensure_schema`] and [`SqlStore::upsert_video`] exist for
//! embedded and test databases; the seeding helper never rewrites an
//! existing user or tag row.
//!
//! ```sql
//! users              (id, username)
//! videos             (id, user_id, category_id, title, video_url, thumbnail_url,
//!                     duration, views_member, views_non_member, access_tier,
//!                     is_published, is_hidden, created_at, deleted_at)
//! tags               (id, name)
//! video_tags         (video_id, tag_id)
//! view_flush_batches (batch_id, applied_at)
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! Every numeric and flag column is BIGINT because the `Any` driver only
//! decodes i64 reliably across MySQL and SQLite. `created_at`/`deleted_at`
//! are epoch millis for the same reason. MySQL TEXT comes back as BLOB, so
//! strings are read with a `Vec<u8>` fallback.

use std::sync::Once;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::debug;

use super::traits::{FlushOutcome, StorageError, StorePage, SummaryStore, ViewIncrement};
use crate::resilience::retry::{retry, RetryConfig};
use crate::video::{StoredVideo, VideoSummary, ViewerClass};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const ELIGIBLE: &str = "videos.is_published = 1 AND videos.is_hidden = 0 \
     AND videos.deleted_at IS NULL AND videos.access_tier = 0";

const SUMMARY_COLUMNS: &str = "videos.id, videos.title, videos.duration, \
     videos.views_member, videos.views_non_member, videos.thumbnail_url, \
     videos.category_id, videos.user_id, videos.video_url, \
     COALESCE(users.username, '') AS username, videos.created_at";

const SQLITE_SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        username TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS videos (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL DEFAULT 0,
        category_id INTEGER NOT NULL DEFAULT 0,
        title TEXT NOT NULL,
        video_url TEXT NOT NULL,
        thumbnail_url TEXT,
        duration INTEGER NOT NULL DEFAULT 0,
        views_member INTEGER NOT NULL DEFAULT 0,
        views_non_member INTEGER NOT NULL DEFAULT 0,
        access_tier INTEGER NOT NULL DEFAULT 0,
        is_published INTEGER NOT NULL DEFAULT 1,
        is_hidden INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL DEFAULT 0,
        deleted_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS video_tags (
        video_id INTEGER NOT NULL,
        tag_id INTEGER NOT NULL,
        PRIMARY KEY (video_id, tag_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS view_flush_batches (
        batch_id TEXT PRIMARY KEY,
        applied_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_flush_applied ON view_flush_batches (applied_at)",
];

const MYSQL_SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGINT PRIMARY KEY,
        username VARCHAR(100) NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS videos (
        id BIGINT PRIMARY KEY,
        user_id BIGINT NOT NULL DEFAULT 0,
        category_id BIGINT NOT NULL DEFAULT 0,
        title VARCHAR(200) NOT NULL,
        video_url VARCHAR(500) NOT NULL,
        thumbnail_url VARCHAR(500),
        duration BIGINT NOT NULL DEFAULT 0,
        views_member BIGINT NOT NULL DEFAULT 0,
        views_non_member BIGINT NOT NULL DEFAULT 0,
        access_tier BIGINT NOT NULL DEFAULT 0,
        is_published BIGINT NOT NULL DEFAULT 1,
        is_hidden BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL DEFAULT 0,
        deleted_at BIGINT NULL,
        INDEX idx_user (user_id),
        INDEX idx_deleted (deleted_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id BIGINT PRIMARY KEY,
        name VARCHAR(50) NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS video_tags (
        video_id BIGINT NOT NULL,
        tag_id BIGINT NOT NULL,
        PRIMARY KEY (video_id, tag_id),
        INDEX idx_tag (tag_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS view_flush_batches (
        batch_id VARCHAR(64) PRIMARY KEY,
        applied_at BIGINT NOT NULL,
        INDEX idx_flush_applied (applied_at)
    )
    "#,
];

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn text(row: &AnyRow, column: &str) -> String {
    row.try_get::<String, _>(column)
        .ok()
        .or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        })
        .unwrap_or_default()
}

fn int(row: &AnyRow, column: &str) -> i64 {
    row.try_get::<i64, _>(column).unwrap_or(0)
}

fn summary_from_row(row: &AnyRow) -> Result<VideoSummary, StorageError> {
    let id: i64 = row
        .try_get("id")
        .map_err(|e| StorageError::Decode(format!("videos.id: {}", e)))?;
    Ok(VideoSummary {
        id: id as u64,
        title: text(row, "title"),
        duration: int(row, "duration").clamp(0, i64::from(u32::MAX)) as u32,
        views: (int(row, "views_member") + int(row, "views_non_member")).max(0) as u64,
        thumbnail_url: text(row, "thumbnail_url"),
        category_id: int(row, "category_id").max(0) as u64,
        user_id: int(row, "user_id").max(0) as u64,
        video_url: text(row, "video_url"),
        username: text(row, "username"),
        created_at: int(row, "created_at"),
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
    read_retry: RetryConfig,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_max_connections(connection_string, 20).await
    }

    pub async fn with_max_connections(connection_string: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections.max(1))
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite, read_retry: RetryConfig::query() };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    /// Create any missing tables. Only for embedded and test deployments;
    /// production schemas belong to the backend's migrations.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite { &SQLITE_SCHEMA } else { &MYSQL_SCHEMA };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }
        Ok(())
    }

    fn random_order(&self) -> &'static str {
        if self.is_sqlite { "RANDOM()" } else { "RAND()" }
    }

    /// Seed a video row and its tag links (embedded and test databases).
    ///
    /// The video row and its links are replaced. The owner and tag rows are
    /// only inserted when absent, so existing usernames and tag names stay.
    pub async fn upsert_video(&self, video: &StoredVideo) -> Result<(), StorageError> {
        let s = &video.summary;
        let id = s.id as i64;
        let mut tx = self.pool.begin().await?;

        let user = sqlx::query("SELECT COUNT(*) AS cnt FROM users WHERE id = ?")
            .bind(s.user_id as i64)
            .fetch_one(&mut *tx)
            .await?;
        if int(&user, "cnt") == 0 {
            sqlx::query("INSERT INTO users (id, username) VALUES (?, ?)")
                .bind(s.user_id as i64)
                .bind(&s.username)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM videos WHERE id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query(
            "INSERT INTO videos (id, user_id, category_id, title, video_url, thumbnail_url, duration, \
             views_member, views_non_member, access_tier, is_published, is_hidden, created_at, deleted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(s.user_id as i64)
        .bind(s.category_id as i64)
        .bind(&s.title)
        .bind(&s.video_url)
        .bind(&s.thumbnail_url)
        .bind(i64::from(s.duration))
        .bind(video.views_member as i64)
        .bind(video.views_non_member as i64)
        .bind(i64::from(video.access_tier))
        .bind(i64::from(video.is_published))
        .bind(i64::from(video.is_hidden))
        .bind(s.created_at)
        .bind(if video.is_deleted { Some(now_millis()) } else { None })
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM video_tags WHERE video_id = ?").bind(id).execute(&mut *tx).await?;
        for tag_id in &video.tag_ids {
            let tag_id = *tag_id as i64;
            let tag = sqlx::query("SELECT COUNT(*) AS cnt FROM tags WHERE id = ?")
                .bind(tag_id)
                .fetch_one(&mut *tx)
                .await?;
            if int(&tag, "cnt") == 0 {
                sqlx::query("INSERT INTO tags (id, name) VALUES (?, ?)")
                    .bind(tag_id)
                    .bind(format!("tag-{}", tag_id))
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("INSERT INTO video_tags (video_id, tag_id) VALUES (?, ?)")
                .bind(id)
                .bind(tag_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Durable (member, non-member) counters.
    pub async fn view_counts(&self, video_id: u64) -> Result<Option<(u64, u64)>, StorageError> {
        let row = sqlx::query("SELECT views_member, views_non_member FROM videos WHERE id = ?")
            .bind(video_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (int(&r, "views_member").max(0) as u64, int(&r, "views_non_member").max(0) as u64)))
    }

    async fn fetch_ids(&self, op: &str, sql: &str, bind: i64) -> Result<Vec<u64>, StorageError> {
        retry(op, &self.read_retry, || async {
            let rows = sqlx::query(sql).bind(bind).fetch_all(&self.pool).await?;
            Ok::<_, StorageError>(rows.iter().map(|r| int(r, "id").max(0) as u64).collect())
        })
        .await
    }

    async fn page(&self, op: &str, count_sql: &str, page_sql: &str, binds: &[i64], offset: usize, limit: usize) -> Result<StorePage, StorageError> {
        retry(op, &self.read_retry, || async {
            let mut count = sqlx::query(count_sql);
            for b in binds {
                count = count.bind(*b);
            }
            let total = int(&count.fetch_one(&self.pool).await?, "cnt").max(0) as u64;

            if limit == 0 || offset as u64 >= total {
                return Ok::<_, StorageError>(StorePage { videos: vec![], total });
            }

            let mut query = sqlx::query(page_sql);
            for b in binds {
                query = query.bind(*b);
            }
            let rows = query
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?;

            let videos = rows.iter().map(summary_from_row).collect::<Result<Vec<_>, _>>()?;
            Ok(StorePage { videos, total })
        })
        .await
    }
}

#[async_trait]
impl SummaryStore for SqlStore {
    async fn list_tag_ids(&self) -> Result<Vec<u64>, StorageError> {
        retry("sql_list_tags", &self.read_retry, || async {
            let rows = sqlx::query("SELECT id FROM tags ORDER BY id").fetch_all(&self.pool).await?;
            Ok::<_, StorageError>(rows.iter().map(|r| int(r, "id").max(0) as u64).collect())
        })
        .await
    }

    async fn find_videos_by_tag_eligible(&self, tag_id: u64) -> Result<Vec<u64>, StorageError> {
        let sql = format!(
            "SELECT video_tags.video_id AS id FROM video_tags \
             INNER JOIN videos ON videos.id = video_tags.video_id \
             WHERE video_tags.tag_id = ? AND {} ORDER BY video_tags.video_id",
            ELIGIBLE
        );
        self.fetch_ids("sql_videos_by_tag", &sql, tag_id as i64).await
    }

    async fn find_video_summary(&self, video_id: u64) -> Result<Option<VideoSummary>, StorageError> {
        let sql = format!(
            "SELECT {} FROM videos LEFT JOIN users ON users.id = videos.user_id \
             WHERE videos.id = ? AND videos.deleted_at IS NULL",
            SUMMARY_COLUMNS
        );
        retry("sql_video_summary", &self.read_retry, || async {
            let row = sqlx::query(&sql).bind(video_id as i64).fetch_optional(&self.pool).await?;
            row.as_ref().map(summary_from_row).transpose()
        })
        .await
    }

    async fn find_tag_ids_for_video(&self, video_id: u64) -> Result<Vec<u64>, StorageError> {
        self.fetch_ids(
            "sql_tags_for_video",
            "SELECT tag_id AS id FROM video_tags WHERE video_id = ? ORDER BY tag_id",
            video_id as i64,
        )
        .await
    }

    #[tracing::instrument(skip(self, increments), fields(videos = increments.len()))]
    async fn apply_view_increments(
        &self,
        batch_id: &str,
        increments: &[ViewIncrement],
    ) -> Result<FlushOutcome, StorageError> {
        // Single attempt: the flush worker owns retry and the batch id makes
        // a replay safe.
        let mut tx = self.pool.begin().await?;

        if !batch_id.is_empty() {
            let seen = sqlx::query("SELECT COUNT(*) AS cnt FROM view_flush_batches WHERE batch_id = ?")
                .bind(batch_id)
                .fetch_one(&mut *tx)
                .await?;
            if int(&seen, "cnt") > 0 {
                tx.rollback().await?;
                debug!(batch_id, "Flush batch already applied");
                return Ok(FlushOutcome::AlreadyApplied);
            }
            sqlx::query("INSERT INTO view_flush_batches (batch_id, applied_at) VALUES (?, ?)")
                .bind(batch_id)
                .bind(now_millis())
                .execute(&mut *tx)
                .await?;
        }

        for inc in increments.iter().filter(|i| !i.is_zero()) {
            sqlx::query(
                "UPDATE videos SET views_member = views_member + ?, \
                 views_non_member = views_non_member + ? WHERE id = ?",
            )
            .bind(inc.member as i64)
            .bind(inc.non_member as i64)
            .bind(inc.video_id as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(FlushOutcome::Applied)
    }

    async fn prune_flush_batches(&self, retention: Duration) -> Result<u64, StorageError> {
        let cutoff = now_millis().saturating_sub(retention.as_millis() as i64);
        let result = sqlx::query("DELETE FROM view_flush_batches WHERE applied_at <= ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_eligible_by_tags(
        &self,
        tag_ids: &[u64],
        offset: usize,
        limit: usize,
    ) -> Result<StorePage, StorageError> {
        if tag_ids.is_empty() {
            return Ok(StorePage::default());
        }
        let filter = format!(
            "videos.id IN (SELECT video_id FROM video_tags WHERE tag_id IN ({})) AND {}",
            placeholders(tag_ids.len()),
            ELIGIBLE
        );
        let count_sql = format!("SELECT COUNT(*) AS cnt FROM videos WHERE {}", filter);
        let page_sql = format!(
            "SELECT {} FROM videos LEFT JOIN users ON users.id = videos.user_id \
             WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            SUMMARY_COLUMNS,
            filter,
            self.random_order()
        );
        let binds: Vec<i64> = tag_ids.iter().map(|t| *t as i64).collect();
        self.page("sql_list_by_tags", &count_sql, &page_sql, &binds, offset, limit).await
    }

    async fn list_eligible(&self, offset: usize, limit: usize) -> Result<StorePage, StorageError> {
        let count_sql = format!("SELECT COUNT(*) AS cnt FROM videos WHERE {}", ELIGIBLE);
        let page_sql = format!(
            "SELECT {} FROM videos LEFT JOIN users ON users.id = videos.user_id \
             WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            SUMMARY_COLUMNS,
            ELIGIBLE,
            self.random_order()
        );
        self.page("sql_list_eligible", &count_sql, &page_sql, &[], offset, limit).await
    }

    async fn increment_view_direct(&self, video_id: u64, class: ViewerClass) -> Result<(), StorageError> {
        let sql = match class {
            ViewerClass::Member => {
                "UPDATE videos SET views_member = views_member + 1 WHERE id = ? AND deleted_at IS NULL"
            }
            ViewerClass::NonMember => {
                "UPDATE videos SET views_non_member = views_non_member + 1 WHERE id = ? AND deleted_at IS NULL"
            }
        };
        let result = sqlx::query(sql).bind(video_id as i64).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("reco_sql_{}_{}.db", name, uuid::Uuid::new_v4()))
    }

    /// Clean up SQLite database and its WAL files
    fn cleanup_db(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(format!("{}-wal", path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", path.display()));
    }

    async fn open(path: &PathBuf) -> SqlStore {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let store = SqlStore::new(&url).await.unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    fn video(id: u64, tags: Vec<u64>) -> StoredVideo {
        let mut summary = VideoSummary::new(id, format!("video {}", id), format!("media/{}.mp4", id));
        summary.user_id = 100 + id;
        summary.username = format!("user{}", id);
        summary.duration = 60;
        StoredVideo::public(summary, tags)
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let db_path = temp_db_path("schema");
        let store = open(&db_path).await;
        store.ensure_schema().await.unwrap();
        assert!(store.list_tag_ids().await.unwrap().is_empty());
        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_summary_joins_username() {
        let db_path = temp_db_path("summary");
        let store = open(&db_path).await;
        let mut v = video(12, vec![3]);
        v.views_member = 4;
        v.views_non_member = 6;
        store.upsert_video(&v).await.unwrap();

        let summary = store.find_video_summary(12).await.unwrap().unwrap();
        assert_eq!(summary.title, "video 12");
        assert_eq!(summary.username, "user12");
        assert_eq!(summary.views, 10);
        assert_eq!(summary.duration, 60);
        assert!(store.find_video_summary(404).await.unwrap().is_none());

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_eligibility_filter() {
        let db_path = temp_db_path("eligible");
        let store = open(&db_path).await;
        store.upsert_video(&video(1, vec![10])).await.unwrap();
        let mut hidden = video(2, vec![10]);
        hidden.is_hidden = true;
        store.upsert_video(&hidden).await.unwrap();
        let mut premium = video(3, vec![10]);
        premium.access_tier = 2;
        store.upsert_video(&premium).await.unwrap();
        let mut deleted = video(4, vec![10]);
        deleted.is_deleted = true;
        store.upsert_video(&deleted).await.unwrap();

        assert_eq!(store.find_videos_by_tag_eligible(10).await.unwrap(), vec![1]);
        let page = store.list_eligible_by_tags(&[10], 0, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.videos[0].id, 1);
        assert_eq!(store.find_tag_ids_for_video(2).await.unwrap(), vec![10]);

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_multi_tag_page_is_deduplicated() {
        let db_path = temp_db_path("dedupe");
        let store = open(&db_path).await;
        store.upsert_video(&video(5, vec![1])).await.unwrap();
        store.upsert_video(&video(9, vec![1, 2])).await.unwrap();
        store.upsert_video(&video(12, vec![2])).await.unwrap();

        let page = store.list_eligible_by_tags(&[1, 2], 0, 10).await.unwrap();
        assert_eq!(page.total, 3);
        let mut ids: Vec<u64> = page.videos.iter().map(|v| v.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![5, 9, 12]);

        let past_end = store.list_eligible_by_tags(&[1, 2], 3, 10).await.unwrap();
        assert!(past_end.videos.is_empty());
        assert_eq!(past_end.total, 3);

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_apply_increments_is_idempotent_per_batch() {
        let db_path = temp_db_path("flush");
        let store = open(&db_path).await;
        store.upsert_video(&video(5, vec![])).await.unwrap();
        let incs = [ViewIncrement { video_id: 5, member: 3, non_member: 1 }];

        assert_eq!(store.apply_view_increments("b-1", &incs).await.unwrap(), FlushOutcome::Applied);
        assert_eq!(store.apply_view_increments("b-1", &incs).await.unwrap(), FlushOutcome::AlreadyApplied);
        assert_eq!(store.view_counts(5).await.unwrap(), Some((3, 1)));

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_flush_batches_pruned_after_retention() {
        let db_path = temp_db_path("prune");
        let store = open(&db_path).await;
        store.upsert_video(&video(5, vec![])).await.unwrap();
        let incs = [ViewIncrement { video_id: 5, member: 1, non_member: 0 }];
        store.apply_view_increments("b-1", &incs).await.unwrap();

        let week = Duration::from_secs(7 * 24 * 3600);
        assert_eq!(store.prune_flush_batches(week).await.unwrap(), 0);
        assert_eq!(store.apply_view_increments("b-1", &incs).await.unwrap(), FlushOutcome::AlreadyApplied);

        assert_eq!(store.prune_flush_batches(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(store.apply_view_increments("b-1", &incs).await.unwrap(), FlushOutcome::Applied);
        assert_eq!(store.view_counts(5).await.unwrap(), Some((2, 0)));

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_upsert_keeps_existing_tag_and_user_rows() {
        let db_path = temp_db_path("seed");
        let store = open(&db_path).await;
        sqlx::query("INSERT INTO users (id, username) VALUES (?, ?)")
            .bind(107i64)
            .bind("original-owner")
            .execute(&store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO tags (id, name) VALUES (?, ?)")
            .bind(1i64)
            .bind("cooking")
            .execute(&store.pool())
            .await
            .unwrap();

        store.upsert_video(&video(7, vec![1, 2])).await.unwrap();

        let tag = sqlx::query("SELECT name FROM tags WHERE id = ?").bind(1i64).fetch_one(&store.pool()).await.unwrap();
        assert_eq!(text(&tag, "name"), "cooking");
        let seeded = sqlx::query("SELECT name FROM tags WHERE id = ?").bind(2i64).fetch_one(&store.pool()).await.unwrap();
        assert_eq!(text(&seeded, "name"), "tag-2");
        let summary = store.find_video_summary(7).await.unwrap().unwrap();
        assert_eq!(summary.username, "original-owner");
        assert_eq!(store.find_tag_ids_for_video(7).await.unwrap(), vec![1, 2]);

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_increment_direct() {
        let db_path = temp_db_path("direct");
        let store = open(&db_path).await;
        store.upsert_video(&video(8, vec![])).await.unwrap();

        store.increment_view_direct(8, ViewerClass::NonMember).await.unwrap();
        assert_eq!(store.view_counts(8).await.unwrap(), Some((0, 1)));
        assert!(matches!(
            store.increment_view_direct(404, ViewerClass::Member).await,
            Err(StorageError::NotFound)
        ));

        cleanup_db(&db_path);
    }
}
