//! Record Store: per-URL records partitioned by processing date.
//!
//! Each stage writes only its own field group. Rows are never deleted.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::record::{
    ClassifyFailure, DiscoveredPage, Exclusion, FileType, Newness, Record,
};

/// Columns added after the first schema. `ensure_schema` adds whichever are missing.
const EVOLVED_COLUMNS: &[(&str, &str)] = &[
    ("extracted_text", "TEXT"),
    ("source_text_hash", "TEXT"),
    ("page_date", "TEXT"),
    ("scrape_error", "TEXT"),
    ("scrape_attempts", "INTEGER NOT NULL DEFAULT 0"),
    ("is_new", "TEXT"),
    ("category", "TEXT"),
    ("summary", "TEXT"),
    ("classified_hash", "TEXT"),
    ("classify_failure", "TEXT"),
    ("classify_error", "TEXT"),
    ("classify_attempts", "INTEGER NOT NULL DEFAULT 0"),
    ("excluded", "TEXT"),
    ("exclusion_reason", "TEXT"),
];

/// Which classification candidates to select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Normal pass: never classified (parse failures excluded) or content changed since.
    Pending,
    /// Retry pass: anything without a current classification, parse failures included.
    Failed,
}

/// Fields written by a successful classification.
#[derive(Debug, Clone)]
pub struct ClassificationWrite {
    pub is_new: Newness,
    pub category: String,
    pub summary: String,
    /// The `source_text_hash` the classification was made from.
    pub classified_hash: String,
    /// `Some(Automatic)` when staleness fired. `None` leaves the flag as it is.
    pub exclusion: Option<Exclusion>,
    pub exclusion_reason: Option<String>,
}

#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

fn partition_key(partition: NaiveDate) -> String {
    partition.format("%Y-%m-%d").to_string()
}

impl RecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the records table and add any columns missing from an older database.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                partition_date TEXT NOT NULL,
                url TEXT NOT NULL,
                lastmodified TEXT,
                filetype TEXT NOT NULL DEFAULT 'html',
                discovered_at TEXT NOT NULL,
                PRIMARY KEY (partition_date, url)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create records table")?;

        let existing: Vec<String> = sqlx::query("PRAGMA table_info(records)")
            .fetch_all(&self.pool)
            .await
            .context("failed to inspect records table")?
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()?;

        for (name, decl) in EVOLVED_COLUMNS {
            if existing.iter().any(|c| c == name) {
                continue;
            }
            info!("Adding column {} to records", name);
            sqlx::query(&format!("ALTER TABLE records ADD COLUMN {} {}", name, decl))
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to add column {}", name))?;
        }

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_url ON records(url)")
            .execute(&self.pool)
            .await
            .context("failed to create url index")?;

        Ok(())
    }

    /// Insert a discovered page if the partition does not have it yet.
    /// Returns true when a new row was created.
    pub async fn register(&self, partition: NaiveDate, page: &DiscoveredPage) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO records (partition_date, url, lastmodified, filetype, discovered_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(partition_date, url) DO NOTHING
            "#,
        )
        .bind(partition_key(partition))
        .bind(&page.url)
        .bind(&page.lastmodified)
        .bind(page.filetype.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to register record")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, partition: NaiveDate, url: &str) -> Result<Option<Record>> {
        let row = sqlx::query("SELECT * FROM records WHERE partition_date = ? AND url = ?")
            .bind(partition_key(partition))
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch record")?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// All records of a partition, ordered by url.
    pub async fn list(&self, partition: NaiveDate) -> Result<Vec<Record>> {
        let rows = sqlx::query("SELECT * FROM records WHERE partition_date = ? ORDER BY url")
            .bind(partition_key(partition))
            .fetch_all(&self.pool)
            .await
            .context("failed to list records")?;

        rows.iter().map(record_from_row).collect()
    }

    /// New content (a changed hash) resets the classification attempt counter and
    /// failure marker, so the record is eligible for classification again.
    pub async fn record_scrape_success(
        &self,
        partition: NaiveDate,
        url: &str,
        lastmodified: Option<&str>,
        text: &str,
        text_hash: &str,
        page_date: Option<NaiveDate>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE records
            SET lastmodified = ?, extracted_text = ?, source_text_hash = ?, page_date = ?,
                scrape_error = NULL, scrape_attempts = scrape_attempts + 1,
                classify_attempts = CASE WHEN source_text_hash IS ? THEN classify_attempts ELSE 0 END,
                classify_failure = CASE WHEN source_text_hash IS ? THEN classify_failure ELSE NULL END,
                classify_error = CASE WHEN source_text_hash IS ? THEN classify_error ELSE NULL END
            WHERE partition_date = ? AND url = ?
            "#,
        )
        .bind(lastmodified)
        .bind(text)
        .bind(text_hash)
        .bind(page_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(text_hash)
        .bind(text_hash)
        .bind(text_hash)
        .bind(partition_key(partition))
        .bind(url)
        .execute(&self.pool)
        .await
        .context("failed to store scrape result")?;

        debug!("Stored {} chars for {}", text.len(), url);
        Ok(())
    }

    /// Previously extracted text is kept; only the marker and counters change.
    pub async fn record_scrape_failure(
        &self,
        partition: NaiveDate,
        url: &str,
        lastmodified: Option<&str>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE records
            SET lastmodified = ?, scrape_error = ?, scrape_attempts = scrape_attempts + 1
            WHERE partition_date = ? AND url = ?
            "#,
        )
        .bind(lastmodified)
        .bind(error)
        .bind(partition_key(partition))
        .bind(url)
        .execute(&self.pool)
        .await
        .context("failed to store scrape failure")?;
        Ok(())
    }

    /// Scrape-failed or never-attempted records still below the attempt cap.
    pub async fn scrape_retry_candidates(
        &self,
        partition: NaiveDate,
        max_attempts: u32,
    ) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM records
            WHERE partition_date = ?
              AND (scrape_error IS NOT NULL OR scrape_attempts = 0)
              AND scrape_attempts < ?
            ORDER BY url
            "#,
        )
        .bind(partition_key(partition))
        .bind(max_attempts as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to select scrape retry candidates")?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn classification_candidates(
        &self,
        partition: NaiveDate,
        selection: Selection,
        max_attempts: u32,
    ) -> Result<Vec<Record>> {
        let selection_clause = match selection {
            Selection::Pending => {
                "classify_failure IS NOT 'parse' \
                 AND (is_new IS NULL OR classified_hash IS NOT source_text_hash)"
            }
            Selection::Failed => "(is_new IS NULL OR classified_hash IS NOT source_text_hash)",
        };
        let sql = format!(
            r#"
            SELECT * FROM records
            WHERE partition_date = ?
              AND extracted_text IS NOT NULL
              AND scrape_error IS NULL
              AND excluded IS NOT 'manual'
              AND classify_attempts < ?
              AND {}
            ORDER BY url
            "#,
            selection_clause
        );

        let rows = sqlx::query(&sql)
            .bind(partition_key(partition))
            .bind(max_attempts as i64)
            .fetch_all(&self.pool)
            .await
            .context("failed to select classification candidates")?;

        rows.iter().map(record_from_row).collect()
    }

    /// Write a successful classification and clear any failure marker.
    ///
    /// Rows flagged `manual` are left untouched; returns false in that case.
    pub async fn record_classification(
        &self,
        partition: NaiveDate,
        url: &str,
        write: &ClassificationWrite,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE records
            SET is_new = ?, category = ?, summary = ?, classified_hash = ?,
                excluded = COALESCE(?, excluded),
                exclusion_reason = CASE WHEN ? IS NULL THEN exclusion_reason ELSE ? END,
                classify_failure = NULL, classify_error = NULL, classify_attempts = 0
            WHERE partition_date = ? AND url = ? AND excluded IS NOT 'manual'
            "#,
        )
        .bind(write.is_new.as_str())
        .bind(&write.category)
        .bind(&write.summary)
        .bind(&write.classified_hash)
        .bind(write.exclusion.map(|e| e.as_str()))
        .bind(write.exclusion.map(|e| e.as_str()))
        .bind(&write.exclusion_reason)
        .bind(partition_key(partition))
        .bind(url)
        .execute(&self.pool)
        .await
        .context("failed to store classification")?;

        Ok(result.rows_affected() > 0)
    }

    /// Leaves any earlier successful classification in place.
    pub async fn record_classify_failure(
        &self,
        partition: NaiveDate,
        url: &str,
        kind: ClassifyFailure,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE records
            SET classify_failure = ?, classify_error = ?, classify_attempts = classify_attempts + 1
            WHERE partition_date = ? AND url = ?
            "#,
        )
        .bind(kind.as_str())
        .bind(message)
        .bind(partition_key(partition))
        .bind(url)
        .execute(&self.pool)
        .await
        .context("failed to store classification failure")?;
        Ok(())
    }

    /// Administrative: flag a record `manual`. Returns false if the record does not exist.
    pub async fn set_exclusion(
        &self,
        partition: NaiveDate,
        url: &str,
        reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE records SET excluded = 'manual', exclusion_reason = ? WHERE partition_date = ? AND url = ?",
        )
        .bind(reason)
        .bind(partition_key(partition))
        .bind(url)
        .execute(&self.pool)
        .await
        .context("failed to set exclusion")?;

        Ok(result.rows_affected() > 0)
    }

    /// Administrative: clear either kind of exclusion flag.
    pub async fn clear_exclusion(&self, partition: NaiveDate, url: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE records SET excluded = NULL, exclusion_reason = NULL WHERE partition_date = ? AND url = ?",
        )
        .bind(partition_key(partition))
        .bind(url)
        .execute(&self.pool)
        .await
        .context("failed to clear exclusion")?;

        Ok(result.rows_affected() > 0)
    }

    /// Records eligible for the briefing, ordered by url.
    pub async fn briefing_selection(
        &self,
        partition: NaiveDate,
        include_maybe: bool,
    ) -> Result<Vec<Record>> {
        let newness = if include_maybe {
            "('new', 'maybe')"
        } else {
            "('new')"
        };
        let sql = format!(
            r#"
            SELECT * FROM records
            WHERE partition_date = ?
              AND is_new IN {}
              AND excluded IS NULL
              AND scrape_error IS NULL
              AND classify_failure IS NULL
              AND summary IS NOT NULL
              AND classified_hash = source_text_hash
            ORDER BY url
            "#,
            newness
        );

        let rows = sqlx::query(&sql)
            .bind(partition_key(partition))
            .fetch_all(&self.pool)
            .await
            .context("failed to select briefing records")?;

        rows.iter().map(record_from_row).collect()
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<T>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| s.parse::<T>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("bad value in column {}: {}", column, e))
}

fn record_from_row(row: &SqliteRow) -> Result<Record> {
    let partition: String = row.try_get("partition_date")?;
    let partition = NaiveDate::parse_from_str(&partition, "%Y-%m-%d")
        .with_context(|| format!("bad partition date {}", partition))?;

    let page_date: Option<String> = row.try_get("page_date")?;
    let page_date = page_date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok());

    let discovered_at: DateTime<Utc> = row.try_get("discovered_at")?;

    Ok(Record {
        partition,
        url: row.try_get("url")?,
        lastmodified: row.try_get("lastmodified")?,
        filetype: parse_column::<FileType>(row, "filetype")?.unwrap_or(FileType::Html),
        extracted_text: row.try_get("extracted_text")?,
        source_text_hash: row.try_get("source_text_hash")?,
        page_date,
        scrape_error: row.try_get("scrape_error")?,
        scrape_attempts: row.try_get::<i64, _>("scrape_attempts")?.max(0) as u32,
        is_new: parse_column(row, "is_new")?,
        category: row.try_get("category")?,
        summary: row.try_get("summary")?,
        classified_hash: row.try_get("classified_hash")?,
        classify_failure: parse_column(row, "classify_failure")?,
        classify_error: row.try_get("classify_error")?,
        classify_attempts: row.try_get::<i64, _>("classify_attempts")?.max(0) as u32,
        excluded: parse_column(row, "excluded")?,
        exclusion_reason: row.try_get("exclusion_reason")?,
        discovered_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{text_hash, ProcessingState};

    async fn test_store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.db");
        let pool = common::init_db_pool(&path.to_string_lossy())
            .await
            .expect("pool");
        let store = RecordStore::new(pool);
        store.ensure_schema().await.expect("schema");
        (dir, store)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 10).unwrap()
    }

    fn classified(hash: &str) -> ClassificationWrite {
        ClassificationWrite {
            is_new: Newness::New,
            category: "Press Release".to_string(),
            summary: "Grants announced.".to_string(),
            classified_hash: hash.to_string(),
            exclusion: None,
            exclusion_reason: None,
        }
    }

    #[tokio::test]
    async fn ensure_schema_evolves_old_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("old.db");
        let pool = common::init_db_pool(&path.to_string_lossy())
            .await
            .expect("pool");
        sqlx::query(
            "CREATE TABLE records (partition_date TEXT NOT NULL, url TEXT NOT NULL, lastmodified TEXT, \
             filetype TEXT NOT NULL DEFAULT 'html', discovered_at TEXT NOT NULL, PRIMARY KEY (partition_date, url))",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO records (partition_date, url, lastmodified, discovered_at) VALUES ('2025-10-10', 'https://a', 'T1', '2025-10-10T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let store = RecordStore::new(pool);
        store.ensure_schema().await.expect("evolve");
        // Running twice is harmless.
        store.ensure_schema().await.expect("evolve again");

        let record = store.get(day(), "https://a").await.unwrap().expect("kept");
        assert_eq!(record.lastmodified.as_deref(), Some("T1"));
        assert_eq!(record.scrape_attempts, 0);
        assert_eq!(record.state(), ProcessingState::Discovered);
    }

    #[tokio::test]
    async fn register_is_insert_if_absent() {
        let (_dir, store) = test_store().await;
        let page = DiscoveredPage::new("https://a", Some("T1".to_string()));
        assert!(store.register(day(), &page).await.unwrap());

        let changed = DiscoveredPage::new("https://a", Some("T2".to_string()));
        assert!(!store.register(day(), &changed).await.unwrap());
        let record = store.get(day(), "https://a").await.unwrap().unwrap();
        assert_eq!(record.lastmodified.as_deref(), Some("T1"));

        // Other partitions are independent.
        let next = day().succ_opt().unwrap();
        assert!(store.register(next, &page).await.unwrap());
        assert_eq!(store.list(day()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failure_then_success_clears_marker() {
        let (_dir, store) = test_store().await;
        store
            .register(day(), &DiscoveredPage::new("https://a", None))
            .await
            .unwrap();
        store
            .record_scrape_failure(day(), "https://a", None, "http status 503")
            .await
            .unwrap();
        let r = store.get(day(), "https://a").await.unwrap().unwrap();
        assert_eq!(r.state(), ProcessingState::ScrapeFailed);
        assert_eq!(r.scrape_attempts, 1);

        store
            .record_scrape_success(day(), "https://a", None, "body", &text_hash("body"), None)
            .await
            .unwrap();
        let r = store.get(day(), "https://a").await.unwrap().unwrap();
        assert_eq!(r.state(), ProcessingState::Scraped);
        assert!(r.scrape_error.is_none());
        assert_eq!(r.scrape_attempts, 2);
    }

    #[tokio::test]
    async fn pending_skips_parse_failures_but_failed_selects_them() {
        let (_dir, store) = test_store().await;
        for url in ["https://a", "https://b", "https://c"] {
            store
                .register(day(), &DiscoveredPage::new(url, None))
                .await
                .unwrap();
            store
                .record_scrape_success(day(), url, None, url, &text_hash(url), None)
                .await
                .unwrap();
        }
        store
            .record_classify_failure(day(), "https://a", ClassifyFailure::Parse, "bad json")
            .await
            .unwrap();
        store
            .record_classify_failure(day(), "https://b", ClassifyFailure::Transient, "timeout")
            .await
            .unwrap();

        let pending = store
            .classification_candidates(day(), Selection::Pending, 3)
            .await
            .unwrap();
        let urls: Vec<_> = pending.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://b", "https://c"]);

        let failed = store
            .classification_candidates(day(), Selection::Failed, 3)
            .await
            .unwrap();
        assert_eq!(failed.len(), 3);

        // Attempt cap turns a failure permanent.
        let capped = store
            .classification_candidates(day(), Selection::Failed, 1)
            .await
            .unwrap();
        let urls: Vec<_> = capped.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://c"]);
    }

    #[tokio::test]
    async fn classification_write_respects_manual_flag() {
        let (_dir, store) = test_store().await;
        store
            .register(day(), &DiscoveredPage::new("https://a", None))
            .await
            .unwrap();
        let hash = text_hash("text");
        store
            .record_scrape_success(day(), "https://a", None, "text", &hash, None)
            .await
            .unwrap();
        assert!(store
            .set_exclusion(day(), "https://a", Some("not relevant"))
            .await
            .unwrap());

        let mut write = classified(&hash);
        write.exclusion = Some(Exclusion::Automatic);
        assert!(!store
            .record_classification(day(), "https://a", &write)
            .await
            .unwrap());
        let r = store.get(day(), "https://a").await.unwrap().unwrap();
        assert_eq!(r.excluded, Some(Exclusion::Manual));
        assert_eq!(r.exclusion_reason.as_deref(), Some("not relevant"));
        assert!(r.is_new.is_none());

        assert!(store.clear_exclusion(day(), "https://a").await.unwrap());
        assert!(store
            .record_classification(day(), "https://a", &classified(&hash))
            .await
            .unwrap());
        let r = store.get(day(), "https://a").await.unwrap().unwrap();
        assert_eq!(r.state(), ProcessingState::Classified);
        assert!(r.excluded.is_none());
    }

    #[tokio::test]
    async fn briefing_selection_requires_current_classification() {
        let (_dir, store) = test_store().await;
        for url in ["https://b", "https://a"] {
            store
                .register(day(), &DiscoveredPage::new(url, None))
                .await
                .unwrap();
            store
                .record_scrape_success(day(), url, None, "v1", &text_hash("v1"), None)
                .await
                .unwrap();
            store
                .record_classification(day(), url, &classified(&text_hash("v1")))
                .await
                .unwrap();
        }
        let selected = store.briefing_selection(day(), false).await.unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].url, "https://a");

        // Re-scraped with new content: stale classification is not briefed.
        store
            .record_scrape_success(day(), "https://b", None, "v2", &text_hash("v2"), None)
            .await
            .unwrap();
        let selected = store.briefing_selection(day(), false).await.unwrap();
        assert_eq!(selected.len(), 1);
        let pending = store
            .classification_candidates(day(), Selection::Pending, 3)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].url, "https://b");
    }

    #[tokio::test]
    async fn new_content_resets_exhausted_classification() {
        let (_dir, store) = test_store().await;
        let url = "https://a";
        store
            .register(day(), &DiscoveredPage::new(url, Some("T1".to_string())))
            .await
            .unwrap();
        store
            .record_scrape_success(day(), url, Some("T1"), "v1", &text_hash("v1"), None)
            .await
            .unwrap();
        for _ in 0..3 {
            store
                .record_classify_failure(day(), url, ClassifyFailure::Transient, "timeout")
                .await
                .unwrap();
        }
        store
            .record_classify_failure(day(), url, ClassifyFailure::Parse, "bad json")
            .await
            .unwrap();
        assert!(store
            .classification_candidates(day(), Selection::Failed, 3)
            .await
            .unwrap()
            .is_empty());

        // Same content again: the exhausted counter stays.
        store
            .record_scrape_success(day(), url, Some("T1"), "v1", &text_hash("v1"), None)
            .await
            .unwrap();
        let record = store.get(day(), url).await.unwrap().unwrap();
        assert_eq!(record.classify_attempts, 4);
        assert_eq!(record.classify_failure, Some(ClassifyFailure::Parse));

        store
            .record_scrape_success(day(), url, Some("T2"), "v2 brand new", &text_hash("v2 brand new"), None)
            .await
            .unwrap();
        let record = store.get(day(), url).await.unwrap().unwrap();
        assert_eq!(record.classify_attempts, 0);
        assert_eq!(record.classify_failure, None);
        assert_eq!(record.classify_error, None);

        let pending = store
            .classification_candidates(day(), Selection::Pending, 3)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].url, url);
    }
}
