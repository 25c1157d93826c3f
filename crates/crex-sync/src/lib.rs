//! Reconciliation pipeline: diff a freshly scraped batch against persisted
//! state per source, stage inserts/updates + field-level change records,
//! and commit the lot as one unit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crex_adapters::{adapter_for_source, load_fixture_page, SourceAdapter};
use crex_core::{
    normalize, normalized, ChangeRecord, FieldName, Listing, ListingKey, RawListing, RunStatus,
    ScrapeRun,
};
use crex_storage::{
    CommitPlan, HttpClientConfig, ListingStore, PageFetcher, SnapshotStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crex-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    /// `live` fetches the configured listing URLs; `fixture` parses the
    /// checked-in sample page instead.
    pub mode: String,
    /// Six-field cron expression, one scheduled run per source.
    pub schedule: String,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            data_dir: std::env::var("CREX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            scheduler_enabled: std::env::var("CREX_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            user_agent: std::env::var("CREX_USER_AGENT")
                .unwrap_or_else(|_| "crex-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("CREX_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// A listing present in both persisted and incoming state whose compared
/// fields differ, with one change record per differing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedListing {
    pub listing: Listing,
    pub changes: Vec<ChangeRecord>,
}

/// Outcome of one reconciliation pass. The four buckets partition the
/// union of persisted and incoming keys; nothing is written until the
/// caller commits the staged plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub new: Vec<Listing>,
    pub modified: Vec<ModifiedListing>,
    pub removed: Vec<Listing>,
    pub unchanged: usize,
    pub duplicate_keys: Vec<ListingKey>,
}

impl Reconciliation {
    pub fn commit_plan(&self) -> CommitPlan {
        CommitPlan {
            inserts: self.new.clone(),
            updates: self.modified.iter().map(|m| m.listing.clone()).collect(),
            changes: self
                .modified
                .iter()
                .flat_map(|m| m.changes.iter().cloned())
                .collect(),
        }
    }
}

fn diff_fields(prev: &Listing, next: &Listing, now: DateTime<Utc>) -> Vec<ChangeRecord> {
    let mut changes = Vec::new();
    for field in FieldName::COMPARED {
        let old_value = normalized(prev.field_value(field));
        let new_value = normalized(next.field_value(field));
        if old_value != new_value {
            changes.push(ChangeRecord {
                id: Uuid::new_v4(),
                listing_id: prev.id,
                source: prev.source.clone(),
                field,
                old_value: old_value.map(ToString::to_string),
                new_value: new_value.map(ToString::to_string),
                modified_at: now,
            });
        }
    }
    changes
}

/// Diff an incoming batch against the persisted snapshot of one source.
///
/// Pure: no I/O, and deterministic for a fixed (persisted, incoming) pair.
/// Rows absent from the batch are reported as removed but never staged for
/// deletion. In-batch duplicates of one canonical key collapse to the later
/// record; the colliding keys are surfaced for the caller to log.
pub fn reconcile(
    persisted: Vec<Listing>,
    incoming: Vec<Listing>,
    now: DateTime<Utc>,
) -> Reconciliation {
    let mut persisted_order: Vec<ListingKey> = Vec::with_capacity(persisted.len());
    let mut persisted_by_key: HashMap<ListingKey, Listing> = HashMap::with_capacity(persisted.len());
    for row in persisted {
        let key = row.key();
        if persisted_by_key.insert(key.clone(), row).is_none() {
            persisted_order.push(key);
        }
    }

    // Later batch entry wins on key collision.
    let mut duplicate_keys = Vec::new();
    let mut winner_index: HashMap<ListingKey, usize> = HashMap::with_capacity(incoming.len());
    let mut winners: Vec<(ListingKey, Listing)> = Vec::with_capacity(incoming.len());
    for item in incoming {
        let key = item.key();
        match winner_index.get(&key) {
            Some(&idx) => {
                duplicate_keys.push(key);
                winners[idx].1 = item;
            }
            None => {
                winner_index.insert(key.clone(), winners.len());
                winners.push((key, item));
            }
        }
    }

    let mut new = Vec::new();
    let mut modified = Vec::new();
    let mut unchanged = 0usize;

    for (key, mut item) in winners {
        match persisted_by_key.get(&key) {
            None => {
                item.created_at = now;
                item.updated_at = now;
                new.push(item);
            }
            Some(prev) => {
                let changes = diff_fields(prev, &item, now);
                if changes.is_empty() {
                    unchanged += 1;
                } else {
                    item.id = prev.id;
                    item.created_at = prev.created_at;
                    item.updated_at = now;
                    modified.push(ModifiedListing {
                        listing: item,
                        changes,
                    });
                }
            }
        }
    }

    let removed = persisted_order
        .iter()
        .filter(|key| !winner_index.contains_key(key))
        .filter_map(|key| persisted_by_key.get(key).cloned())
        .collect();

    Reconciliation {
        new,
        modified,
        removed,
        unchanged,
        duplicate_keys,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub status: RunStatus,
    pub properties_count: u32,
    pub new: usize,
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Per-run change report persisted under `data/results/<source>/`. This is
/// what the dashboard's "recent changes" view reads back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: String,
    pub status: RunStatus,
    pub properties_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub new: Vec<Listing>,
    pub modified: Vec<ModifiedListing>,
    pub removed: Vec<Listing>,
    pub unchanged: usize,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("source {0} is disabled")]
    Disabled(String),
    #[error("a run for {0} is already in flight")]
    Busy(String),
    #[error("no adapter registered for {0}")]
    NoAdapter(String),
    #[error("obtaining batch for {source_id}: {message}")]
    Fetch { source_id: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Orchestrates one scrape-and-reconcile pass per source. Passes for the
/// same source are serialized through a per-source lock; the snapshot read
/// and the final commit therefore never interleave with another run of
/// that source. Different sources run freely in parallel.
pub struct ScrapeRunner {
    config: SyncConfig,
    registry: SourceRegistry,
    store: Arc<dyn ListingStore>,
    snapshots: SnapshotStore,
    http: PageFetcher,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ScrapeRunner {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        store: Arc<dyn ListingStore>,
    ) -> Result<Self> {
        let snapshots = SnapshotStore::new(config.data_dir.join("results"));
        let http = PageFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            registry,
            store,
            snapshots,
            http,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn source_config(&self, source_id: &str) -> Result<SourceConfig, RunError> {
        let source = self
            .registry
            .get(source_id)
            .ok_or_else(|| RunError::UnknownSource(source_id.to_string()))?;
        if !source.enabled {
            return Err(RunError::Disabled(source_id.to_string()));
        }
        Ok(source.clone())
    }

    async fn lock_for(&self, source_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one full pass for a source, waiting for any in-flight pass of
    /// the same source to finish first.
    pub async fn run_source(&self, source_id: &str) -> Result<RunSummary, RunError> {
        let source = self.source_config(source_id)?;
        let lock = self.lock_for(source_id).await;
        let _guard = lock.lock_owned().await;
        self.run_locked(&source).await
    }

    /// Fire-and-forget trigger used by the manual-run endpoint. Fails with
    /// [`RunError::Busy`] instead of queueing behind an in-flight pass.
    pub async fn try_spawn(self: Arc<Self>, source_id: &str) -> Result<(), RunError> {
        let source = self.source_config(source_id)?;
        let lock = self.lock_for(source_id).await;
        let guard = lock
            .try_lock_owned()
            .map_err(|_| RunError::Busy(source_id.to_string()))?;
        let runner = self;
        tokio::spawn(async move {
            let _guard = guard;
            match runner.run_locked(&source).await {
                Ok(summary) => info!(
                    source = %summary.source,
                    run_id = %summary.run_id,
                    new = summary.new,
                    modified = summary.modified,
                    removed = summary.removed,
                    "manual run finished"
                ),
                Err(err) => warn!(source = %source.source_id, "manual run failed: {err}"),
            }
        });
        Ok(())
    }

    async fn run_locked(&self, source: &SourceConfig) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("reconcile_run", source = source.source_id.as_str(), %run_id);
        async {
            let raws = match self.fetch_batch(source).await {
                Ok(raws) => raws,
                Err(err) => {
                    warn!(source = %source.source_id, "scrape batch unobtainable: {err}");
                    self.record_error_run(run_id, &source.source_id, 0).await;
                    return Err(err);
                }
            };

            self.reconcile_and_commit(run_id, source, raws, started_at)
                .await
        }
        .instrument(span)
        .await
    }

    /// Normalize + reconcile + commit one already-obtained batch. Exposed
    /// separately so callers that receive records out-of-band (and the
    /// test suite) can drive the pipeline without a live fetch.
    pub async fn ingest_batch(
        &self,
        source_id: &str,
        raws: Vec<RawListing>,
    ) -> Result<RunSummary, RunError> {
        let source = self.source_config(source_id)?;
        let lock = self.lock_for(source_id).await;
        let _guard = lock.lock_owned().await;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.reconcile_and_commit(run_id, &source, raws, started_at)
            .await
    }

    async fn fetch_batch(&self, source: &SourceConfig) -> Result<Vec<RawListing>, RunError> {
        let adapter = adapter_for_source(&source.source_id)
            .ok_or_else(|| RunError::NoAdapter(source.source_id.clone()))?;

        if source.mode == "fixture" {
            let path = self
                .config
                .workspace_root
                .join("fixtures")
                .join(&source.source_id)
                .join("sample.html");
            let html = load_fixture_page(&path).map_err(|err| RunError::Fetch {
                source_id: source.source_id.clone(),
                message: err.to_string(),
            })?;
            return self
                .archive_and_parse(
                    adapter.as_ref(),
                    &source.source_id,
                    &format!("fixture://{}", source.source_id),
                    html.as_bytes(),
                )
                .await;
        }

        let pages = adapter
            .fetch_pages(&self.http, &source.listing_urls)
            .await
            .map_err(|err| RunError::Fetch {
                source_id: source.source_id.clone(),
                message: err.to_string(),
            })?;

        let mut raws = Vec::new();
        for page in &pages {
            raws.extend(
                self.archive_and_parse(
                    adapter.as_ref(),
                    &source.source_id,
                    &page.final_url,
                    &page.body,
                )
                .await?,
            );
        }
        Ok(raws)
    }

    async fn archive_and_parse(
        &self,
        adapter: &dyn SourceAdapter,
        source_id: &str,
        page_url: &str,
        body: &[u8],
    ) -> Result<Vec<RawListing>, RunError> {
        if let Err(err) = self.snapshots.store_page(source_id, "html", body).await {
            warn!(source = %source_id, "raw page archival failed: {err:#}");
        }
        let html = String::from_utf8_lossy(body);
        adapter
            .parse_page(page_url, &html)
            .map_err(|err| RunError::Fetch {
                source_id: source_id.to_string(),
                message: err.to_string(),
            })
    }

    async fn reconcile_and_commit(
        &self,
        run_id: Uuid,
        source: &SourceConfig,
        raws: Vec<RawListing>,
        started_at: DateTime<Utc>,
    ) -> Result<RunSummary, RunError> {
        let source_id = &source.source_id;
        let now = Utc::now();

        let mut batch = Vec::with_capacity(raws.len());
        let mut rejected = 0usize;
        for raw in raws {
            match normalize(raw, source_id, now) {
                Ok(listing) => batch.push(listing),
                Err(err) => {
                    rejected += 1;
                    warn!(source = %source_id, "skipping record: {err}");
                }
            }
        }
        let properties_count = batch.len() as u32;

        let persisted = match self.store.listings_for_source(source_id).await {
            Ok(rows) => rows,
            Err(err) => {
                self.record_error_run(run_id, source_id, properties_count)
                    .await;
                return Err(err.into());
            }
        };

        let outcome = reconcile(persisted, batch, now);
        for key in &outcome.duplicate_keys {
            warn!(source = %source_id, key = %key, "in-batch duplicate canonical key; later record wins");
        }

        if let Err(err) = self.store.commit(outcome.commit_plan()).await {
            self.record_error_run(run_id, source_id, properties_count)
                .await;
            return Err(err.into());
        }

        let status = if rejected > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };
        let finished_at = Utc::now();

        self.store
            .record_run(ScrapeRun {
                id: run_id,
                source: source_id.clone(),
                status,
                properties_count,
                created_at: finished_at,
            })
            .await?;

        let report = RunReport {
            run_id,
            source: source_id.clone(),
            status,
            properties_count,
            started_at,
            finished_at,
            new: outcome.new.clone(),
            modified: outcome.modified.clone(),
            removed: outcome.removed.clone(),
            unchanged: outcome.unchanged,
        };
        if let Err(err) = write_run_report(&self.config.data_dir, &report).await {
            warn!(source = %source_id, "writing run report failed: {err:#}");
        }

        info!(
            source = %source_id,
            %run_id,
            new = report.new.len(),
            modified = report.modified.len(),
            removed = report.removed.len(),
            unchanged = report.unchanged,
            rejected,
            "reconciliation pass complete"
        );

        Ok(RunSummary {
            run_id,
            source: source_id.clone(),
            status,
            properties_count,
            new: report.new.len(),
            modified: report.modified.len(),
            removed: report.removed.len(),
            unchanged: report.unchanged,
            rejected,
            started_at,
            finished_at,
        })
    }

    /// Best-effort: a failed run should still leave a run-log row behind,
    /// but a second storage failure here must not mask the original error.
    async fn record_error_run(&self, run_id: Uuid, source_id: &str, properties_count: u32) {
        let result = self
            .store
            .record_run(ScrapeRun {
                id: run_id,
                source: source_id.to_string(),
                status: RunStatus::Error,
                properties_count,
                created_at: Utc::now(),
            })
            .await;
        if let Err(err) = result {
            warn!(source = %source_id, "recording error run failed: {err}");
        }
    }
}

fn results_dir(data_dir: &Path, source_id: &str) -> PathBuf {
    data_dir.join("results").join(source_id)
}

pub async fn write_run_report(data_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = results_dir(data_dir, &report.source);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let stamp = report.finished_at.format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("changes_{stamp}_{}.json", report.run_id));
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Most recent change report for a source, by file modification time with
/// the filename stamp as tiebreak.
pub async fn latest_run_report(data_dir: &Path, source_id: &str) -> Result<Option<RunReport>> {
    let dir = results_dir(data_dir, source_id);
    let mut reader = match fs::read_dir(&dir).await {
        Ok(reader) => reader,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };

    let mut entries: Vec<(std::time::SystemTime, String)> = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .with_context(|| format!("reading {}", dir.display()))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if !(name.starts_with("changes_") && name.ends_with(".json")) {
            continue;
        }
        if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
            entries.push((modified, name));
        }
    }
    entries.sort();
    let Some((_, latest)) = entries.pop() else {
        return Ok(None);
    };
    let path = dir.join(latest);
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let report = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(report))
}

/// The three disjoint buckets served by the changes endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeBuckets {
    pub new: Vec<Listing>,
    pub modified: Vec<Listing>,
    pub removed: Vec<Listing>,
}

/// Read-side access for the API layer: current listings and the latest
/// run's change buckets. Never mutates the store.
#[derive(Clone)]
pub struct QueryFacade {
    store: Arc<dyn ListingStore>,
    data_dir: PathBuf,
}

impl QueryFacade {
    pub fn new(store: Arc<dyn ListingStore>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            data_dir: data_dir.into(),
        }
    }

    pub async fn current_listings(&self, source: Option<&str>) -> Result<Vec<Listing>, StoreError> {
        match source {
            Some(source) => self.store.listings_for_source(source).await,
            None => self.store.all_listings().await,
        }
    }

    pub async fn recent_changes(&self, source: &str) -> Result<ChangeBuckets> {
        let Some(report) = latest_run_report(&self.data_dir, source).await? else {
            return Ok(ChangeBuckets::default());
        };
        Ok(ChangeBuckets {
            new: report.new,
            modified: report.modified.into_iter().map(|m| m.listing).collect(),
            removed: report.removed,
        })
    }

    pub async fn recent_runs(
        &self,
        source: &str,
        limit: usize,
    ) -> Result<Vec<ScrapeRun>, StoreError> {
        self.store.recent_runs(source, limit).await
    }

    pub async fn change_history(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        self.store.changes_since(source, since).await
    }
}

/// One cron job per enabled source; `None` when scheduling is off.
pub async fn build_scheduler(runner: Arc<ScrapeRunner>) -> Result<Option<JobScheduler>> {
    if !runner.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for source in runner.registry.sources.iter().filter(|s| s.enabled) {
        let job_runner = runner.clone();
        let source_id = source.source_id.clone();
        let job = Job::new_async(source.schedule.as_str(), move |_uuid, _lock| {
            let runner = job_runner.clone();
            let source_id = source_id.clone();
            Box::pin(async move {
                match runner.run_source(&source_id).await {
                    Ok(summary) => info!(
                        source = %summary.source,
                        run_id = %summary.run_id,
                        status = %summary.status,
                        "scheduled run finished"
                    ),
                    Err(err) => warn!("scheduled run for {source_id} failed: {err}"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for {}", source.source_id))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
