//! Persistence boundary for CREX: the listing store (memory + Postgres),
//! raw page archival, and HTTP fetch utilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crex_core::{ChangeRecord, FieldName, Listing, RunStatus, ScrapeRun};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crex-storage";

/// Storage failures keep the read/write distinction because the two abort a
/// reconciliation pass differently: a read failure means nothing was staged,
/// a write failure means a computed plan was discarded.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("loading persisted state: {0}")]
    Read(#[source] anyhow::Error),
    #[error("committing staged writes: {0}")]
    Write(#[source] anyhow::Error),
}

impl StoreError {
    pub fn read(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Read(err.into())
    }

    pub fn write(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Write(err.into())
    }
}

/// Staged output of one reconciliation pass. Applied as a single logical
/// unit: either every row lands or none do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitPlan {
    pub inserts: Vec<Listing>,
    pub updates: Vec<Listing>,
    pub changes: Vec<ChangeRecord>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.changes.is_empty()
    }

    pub fn staged_rows(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.changes.len()
    }
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Per-source snapshot read: every listing currently persisted for the
    /// source, ordered by first sighting.
    async fn listings_for_source(&self, source: &str) -> Result<Vec<Listing>, StoreError>;

    async fn all_listings(&self) -> Result<Vec<Listing>, StoreError>;

    /// Apply a commit plan all-or-nothing.
    async fn commit(&self, plan: CommitPlan) -> Result<(), StoreError>;

    /// Single-row append to the run log.
    async fn record_run(&self, run: ScrapeRun) -> Result<(), StoreError>;

    async fn recent_runs(&self, source: &str, limit: usize) -> Result<Vec<ScrapeRun>, StoreError>;

    async fn changes_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    listings: Vec<Listing>,
    changes: Vec<ChangeRecord>,
    runs: Vec<ScrapeRun>,
}

/// In-process store used by the test suite and DATABASE_URL-less runs.
/// Commit atomicity comes from holding the write lock across the whole
/// plan application.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    state: RwLock<MemoryState>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn listings_for_source(&self, source: &str) -> Result<Vec<Listing>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .listings
            .iter()
            .filter(|l| l.source == source)
            .cloned()
            .collect())
    }

    async fn all_listings(&self) -> Result<Vec<Listing>, StoreError> {
        let state = self.state.read().await;
        Ok(state.listings.clone())
    }

    async fn commit(&self, plan: CommitPlan) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for update in &plan.updates {
            let row = state
                .listings
                .iter_mut()
                .find(|l| l.id == update.id)
                .ok_or_else(|| {
                    StoreError::write(anyhow!("update targets unknown listing {}", update.id))
                })?;
            *row = update.clone();
        }
        state.listings.extend(plan.inserts);
        state.changes.extend(plan.changes);
        Ok(())
    }

    async fn record_run(&self, run: ScrapeRun) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.runs.push(run);
        Ok(())
    }

    async fn recent_runs(&self, source: &str, limit: usize) -> Result<Vec<ScrapeRun>, StoreError> {
        let state = self.state.read().await;
        let mut runs: Vec<ScrapeRun> = state
            .runs
            .iter()
            .filter(|r| r.source == source)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn changes_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let state = self.state.read().await;
        let mut changes: Vec<ChangeRecord> = state
            .changes
            .iter()
            .filter(|c| c.source == source && c.modified_at > since)
            .cloned()
            .collect();
        changes.sort_by(|a, b| a.modified_at.cmp(&b.modified_at));
        Ok(changes)
    }
}

/// Postgres-backed store. Commit plans run inside one transaction, which
/// is what makes the all-or-nothing contract hold.
#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing, sqlx::Error> {
    Ok(Listing {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        property_name: row.try_get("property_name")?,
        address: row.try_get("address")?,
        floor_suite: row.try_get("floor_suite")?,
        space_available: row.try_get("space_available")?,
        price: row.try_get("price")?,
        listing_url: row.try_get("listing_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn change_from_row(row: &PgRow) -> Result<ChangeRecord, StoreError> {
    let field_name: String = row.try_get("field_name").map_err(StoreError::read)?;
    let field = FieldName::parse(&field_name)
        .ok_or_else(|| StoreError::read(anyhow!("unknown field_name {field_name}")))?;
    Ok(ChangeRecord {
        id: row.try_get("id").map_err(StoreError::read)?,
        listing_id: row.try_get("listing_id").map_err(StoreError::read)?,
        source: row.try_get("source").map_err(StoreError::read)?,
        field,
        old_value: row.try_get("old_value").map_err(StoreError::read)?,
        new_value: row.try_get("new_value").map_err(StoreError::read)?,
        modified_at: row.try_get("modified_at").map_err(StoreError::read)?,
    })
}

fn run_from_row(row: &PgRow) -> Result<ScrapeRun, StoreError> {
    let status: String = row.try_get("status").map_err(StoreError::read)?;
    let status = RunStatus::parse(&status)
        .ok_or_else(|| StoreError::read(anyhow!("unknown run status {status}")))?;
    let count: i64 = row.try_get("properties_count").map_err(StoreError::read)?;
    Ok(ScrapeRun {
        id: row.try_get("id").map_err(StoreError::read)?,
        source: row.try_get("source").map_err(StoreError::read)?,
        status,
        properties_count: count.max(0) as u32,
        created_at: row.try_get("created_at").map_err(StoreError::read)?,
    })
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn listings_for_source(&self, source: &str) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, property_name, address, floor_suite,
                   space_available, price, listing_url, created_at, updated_at
              FROM listings
             WHERE source = $1
             ORDER BY created_at, id
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::read)?;

        rows.iter()
            .map(|row| listing_from_row(row).map_err(StoreError::read))
            .collect()
    }

    async fn all_listings(&self) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, property_name, address, floor_suite,
                   space_available, price, listing_url, created_at, updated_at
              FROM listings
             ORDER BY source, created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::read)?;

        rows.iter()
            .map(|row| listing_from_row(row).map_err(StoreError::read))
            .collect()
    }

    async fn commit(&self, plan: CommitPlan) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::write)?;

        for listing in &plan.inserts {
            sqlx::query(
                r#"
                INSERT INTO listings (id, source, property_name, address, floor_suite,
                                      space_available, price, listing_url, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(listing.id)
            .bind(&listing.source)
            .bind(&listing.property_name)
            .bind(&listing.address)
            .bind(&listing.floor_suite)
            .bind(&listing.space_available)
            .bind(&listing.price)
            .bind(&listing.listing_url)
            .bind(listing.created_at)
            .bind(listing.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::write)?;
        }

        for listing in &plan.updates {
            sqlx::query(
                r#"
                UPDATE listings
                   SET property_name = $2,
                       address = $3,
                       floor_suite = $4,
                       space_available = $5,
                       price = $6,
                       listing_url = $7,
                       updated_at = $8
                 WHERE id = $1
                "#,
            )
            .bind(listing.id)
            .bind(&listing.property_name)
            .bind(&listing.address)
            .bind(&listing.floor_suite)
            .bind(&listing.space_available)
            .bind(&listing.price)
            .bind(&listing.listing_url)
            .bind(listing.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::write)?;
        }

        for change in &plan.changes {
            sqlx::query(
                r#"
                INSERT INTO listing_changes (id, listing_id, source, field_name,
                                             old_value, new_value, modified_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(change.id)
            .bind(change.listing_id)
            .bind(&change.source)
            .bind(change.field.as_str())
            .bind(&change.old_value)
            .bind(&change.new_value)
            .bind(change.modified_at)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::write)?;
        }

        tx.commit().await.map_err(StoreError::write)
    }

    async fn record_run(&self, run: ScrapeRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_runs (id, source, status, properties_count, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run.id)
        .bind(&run.source)
        .bind(run.status.as_str())
        .bind(run.properties_count as i64)
        .bind(run.created_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::write)?;
        Ok(())
    }

    async fn recent_runs(&self, source: &str, limit: usize) -> Result<Vec<ScrapeRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, status, properties_count, created_at
              FROM scrape_runs
             WHERE source = $1
             ORDER BY created_at DESC
             LIMIT $2
            "#,
        )
        .bind(source)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::read)?;

        rows.iter().map(run_from_row).collect()
    }

    async fn changes_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, listing_id, source, field_name, old_value, new_value, modified_at
              FROM listing_changes
             WHERE source = $1
               AND modified_at > $2
             ORDER BY modified_at, id
            "#,
        )
        .bind(source)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::read)?;

        rows.iter().map(change_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable raw-page archive. Pages are content-addressed by sha256 and
/// written via atomic temp-file rename, so re-scraping an unchanged page
/// is a no-op on disk.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(&self, source: &str, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(source)
            .join("pages")
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_page(
        &self,
        source: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(source, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(StoredPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("snapshot path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredPage {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Listing-page fetcher with per-source and global concurrency caps and
/// retry-with-backoff on transient failures.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl PageFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_page(&self, source: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("page_fetch", source, url);
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedPage {
                                status,
                                final_url,
                                body,
                                fetched_at: Utc::now(),
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            Err(FetchError::Request(
                last_request_error.expect("retry loop should capture a request error"),
            ))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn listing(source: &str, url: &str, price: &str) -> Listing {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 8, 0, 0).single().unwrap();
        Listing {
            id: Uuid::new_v4(),
            source: source.to_string(),
            property_name: Some("Tower".into()),
            address: None,
            floor_suite: None,
            space_available: None,
            price: Some(price.into()),
            listing_url: Some(url.into()),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn memory_store_filters_by_source_and_keeps_insert_order() {
        let store = MemoryListingStore::new();
        let a = listing("cbre", "https://a", "$10");
        let b = listing("cbre", "https://b", "$20");
        let other = listing("lee", "https://c", "$30");
        store
            .commit(CommitPlan {
                inserts: vec![a.clone(), b.clone(), other],
                ..CommitPlan::default()
            })
            .await
            .unwrap();

        let rows = store.listings_for_source("cbre").await.unwrap();
        assert_eq!(rows, vec![a, b]);
        assert_eq!(store.all_listings().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn memory_store_applies_updates_in_place() {
        let store = MemoryListingStore::new();
        let original = listing("cbre", "https://a", "$10");
        store
            .commit(CommitPlan {
                inserts: vec![original.clone()],
                ..CommitPlan::default()
            })
            .await
            .unwrap();

        let mut updated = original.clone();
        updated.price = Some("$12".into());
        store
            .commit(CommitPlan {
                updates: vec![updated.clone()],
                ..CommitPlan::default()
            })
            .await
            .unwrap();

        let rows = store.listings_for_source("cbre").await.unwrap();
        assert_eq!(rows, vec![updated]);
    }

    #[tokio::test]
    async fn memory_store_rejects_update_for_unknown_row() {
        let store = MemoryListingStore::new();
        let err = store
            .commit(CommitPlan {
                updates: vec![listing("cbre", "https://a", "$10")],
                ..CommitPlan::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Write(_)));
    }

    #[tokio::test]
    async fn memory_store_orders_runs_newest_first() {
        let store = MemoryListingStore::new();
        for (hour, status) in [(1, RunStatus::Success), (2, RunStatus::Partial)] {
            store
                .record_run(ScrapeRun {
                    id: Uuid::new_v4(),
                    source: "cbre".into(),
                    status,
                    properties_count: 5,
                    created_at: Utc.with_ymd_and_hms(2026, 8, 30, hour, 0, 0).single().unwrap(),
                })
                .await
                .unwrap();
        }
        let runs = store.recent_runs("cbre", 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, RunStatus::Partial);
        assert_eq!(runs[1].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn snapshot_store_deduplicates_by_content_hash() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());

        let first = store
            .store_page("cbre", "html", b"<html>same</html>")
            .await
            .expect("first store");
        let second = store
            .store_page("cbre", "html", b"<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retry_classification_is_conservative() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
