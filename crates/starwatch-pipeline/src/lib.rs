//! Enrichment pipeline orchestration for starwatch.
//!
//! Five sequential stages, each a full barrier: rank, metadata enrichment,
//! summary enrichment, normalization + sort, emission. The two enrichment
//! passes run over independent worker pools with a fixed cap; every per-item
//! failure is absorbed into an absent value, and only the ranking fetch and
//! the final write can abort the run.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use starwatch_adapters::{
    ChatCompletionClient, GithubGraphqlClient, JsonRankingSource, RankingSource,
    RepoMetadataSource, SummaryRequest, SummarySource, DEFAULT_SUMMARY_URL, GITHUB_GRAPHQL_URL,
};
use starwatch_core::{EnrichedRepo, RankedRepo, RepoMetadata, ReportRow};
use starwatch_storage::{build_http_client, HttpClientConfig, ReportStore};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "starwatch-pipeline";

/// Fixed worker cap for both enrichment passes. Bounds simultaneous outbound
/// connections, not total throughput.
pub const WORKER_CAP: usize = 10;

const PROGRESS_LOG_EVERY: usize = 50;

/// Optional non-secret settings file, looked up in the working directory.
pub const SETTINGS_FILE: &str = "starwatch.yaml";

pub const DEFAULT_OUTPUT_DIR: &str = "result";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineSettings {
    pub metadata_endpoint: Option<String>,
    pub summary_endpoint: Option<String>,
    pub ranking_path: Option<PathBuf>,
    pub ranking_limit: Option<usize>,
    pub summary_top_n: Option<usize>,
    pub output_dir: Option<PathBuf>,
    pub publish_path: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub scheduler_enabled: Option<bool>,
    pub sync_cron: Option<String>,
}

impl PipelineSettings {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Everything the pipeline driver needs, constructed before any stage runs.
/// Credentials are enumerated explicitly; a missing required key fails
/// construction instead of failing mid-run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub metadata_token: String,
    pub summary_token: String,
    pub summary_model: String,
    pub metadata_endpoint: String,
    pub summary_endpoint: String,
    pub ranking_path: PathBuf,
    pub ranking_limit: usize,
    pub summary_top_n: usize,
    pub output_dir: PathBuf,
    pub publish_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let settings = PipelineSettings::load(Path::new(SETTINGS_FILE))?;
        Self::from_lookup(&settings, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        settings: &PipelineSettings,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let metadata_token = lookup("GH_TOKEN").context("GH_TOKEN is required")?;
        let summary_token = lookup("SUMMARY_API_KEY").context("SUMMARY_API_KEY is required")?;
        let summary_model = lookup("SUMMARY_MODEL").context("SUMMARY_MODEL is required")?;

        Ok(Self {
            metadata_token,
            summary_token,
            summary_model,
            metadata_endpoint: settings
                .metadata_endpoint
                .clone()
                .unwrap_or_else(|| GITHUB_GRAPHQL_URL.to_string()),
            summary_endpoint: settings
                .summary_endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_SUMMARY_URL.to_string()),
            ranking_path: settings
                .ranking_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("data/ranking.json")),
            ranking_limit: settings.ranking_limit.unwrap_or(1000),
            summary_top_n: settings.summary_top_n.unwrap_or(20),
            output_dir: settings
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            publish_path: settings
                .publish_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("web/public/results/result.csv")),
            user_agent: settings
                .user_agent
                .clone()
                .unwrap_or_else(|| "starwatch-bot/0.1".to_string()),
            http_timeout_secs: settings.http_timeout_secs.unwrap_or(20),
            scheduler_enabled: settings.scheduler_enabled.unwrap_or(false),
            sync_cron: settings
                .sync_cron
                .clone()
                .unwrap_or_else(|| "0 0 6 * * *".to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ranked: usize,
    pub metadata_present: usize,
    pub summaries_generated: usize,
    pub report_path: String,
    pub published_path: String,
    pub report_sha256: String,
    pub report_bytes: u64,
}

// ---------------------------------------------------------------------------
// Bounded executor + positional merge
// ---------------------------------------------------------------------------

/// Run index-tagged tasks over a fixed-size worker pool.
///
/// At most `cap` tasks run concurrently; completions are observed in
/// whatever order they finish, each carrying its originating index, and the
/// call returns only once every task has resolved. A panicking task is
/// reported and its slot is simply never filled.
pub(crate) async fn run_bounded<T, R, F, Fut>(
    label: &str,
    tasks: Vec<(usize, T)>,
    cap: usize,
    make_task: F,
) -> Vec<(usize, R)>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = tasks.len();
    if total == 0 {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(cap.max(1)));
    let mut join_set = JoinSet::new();
    for (index, item) in tasks {
        let semaphore = Arc::clone(&semaphore);
        let work = make_task(index, item);
        join_set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore not closed");
            (index, work.await)
        });
    }

    let mut completed = Vec::with_capacity(total);
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, result)) => {
                completed.push((index, result));
                if completed.len() % PROGRESS_LOG_EVERY == 0 || completed.len() == total {
                    info!(pass = label, done = completed.len(), total, "enrichment progress");
                }
            }
            Err(err) => {
                warn!(pass = label, error = %err, "enrichment task panicked; slot left absent");
            }
        }
    }
    completed
}

/// Write each completed result into the slot at its recorded index.
///
/// Indices are assigned once per pass and never reused, so every slot has
/// exactly one writer; a second write to the same slot is a bug.
pub(crate) fn merge_by_index<R>(len: usize, completed: Vec<(usize, R)>) -> Vec<Option<R>> {
    let mut slots: Vec<Option<R>> = Vec::with_capacity(len);
    slots.resize_with(len, || None);
    for (index, result) in completed {
        assert!(
            slots[index].is_none(),
            "result slot {index} written twice within one pass"
        );
        slots[index] = Some(result);
    }
    slots
}

// ---------------------------------------------------------------------------
// Stage functions
// ---------------------------------------------------------------------------

/// Parse creation timestamps into comparable instants. Unparsable or absent
/// values become `None` and sort with the oldest/undefined group.
pub(crate) fn normalize_rows(enriched: Vec<EnrichedRepo>) -> Vec<ReportRow> {
    enriched
        .into_iter()
        .map(|repo| {
            let created_at = repo.created_at.as_deref().and_then(|raw| {
                match DateTime::parse_from_rfc3339(raw) {
                    Ok(instant) => Some(instant.with_timezone(&Utc)),
                    Err(err) => {
                        warn!(
                            repo = %repo.repo_name,
                            raw,
                            error = %err,
                            "unparsable creation timestamp; row sorts as oldest"
                        );
                        None
                    }
                }
            });
            ReportRow {
                repo_name: repo.repo_name,
                star_count: repo.star_count,
                created_at,
                current_star_count: repo.current_star_count,
                ai_summary: repo.ai_summary,
            }
        })
        .collect()
}

/// Descending by creation instant; rows without one go last. Stable, so
/// equal keys keep their pre-sort relative order.
pub(crate) fn sort_rows(rows: &mut [ReportRow]) {
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

pub(crate) fn rows_to_csv(rows: &[ReportRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).context("serializing report row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing report rows: {err}"))
}

// ---------------------------------------------------------------------------
// Pipeline driver
// ---------------------------------------------------------------------------

pub struct Pipeline {
    config: PipelineConfig,
    store: ReportStore,
    ranking: Arc<dyn RankingSource>,
    metadata: Arc<dyn RepoMetadataSource>,
    summaries: Arc<dyn SummarySource>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let http = build_http_client(&HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let ranking = Arc::new(JsonRankingSource::new(config.ranking_path.clone()));
        let metadata = Arc::new(GithubGraphqlClient::new(
            http.clone(),
            config.metadata_endpoint.clone(),
            config.metadata_token.clone(),
        ));
        let summaries = Arc::new(ChatCompletionClient::new(
            http,
            config.summary_endpoint.clone(),
            config.summary_token.clone(),
            config.summary_model.clone(),
        ));
        let store = ReportStore::new(config.output_dir.clone());
        Ok(Self {
            config,
            store,
            ranking,
            metadata,
            summaries,
        })
    }

    /// Swap the external collaborators behind the ports; used by tests and
    /// embedders.
    pub fn with_sources(
        mut self,
        ranking: Arc<dyn RankingSource>,
        metadata: Arc<dyn RepoMetadataSource>,
        summaries: Arc<dyn SummarySource>,
    ) -> Self {
        self.ranking = ranking;
        self.metadata = metadata;
        self.summaries = summaries;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// One full run: rank, enrich, normalize, sort, emit.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "starting trending sync run");

        let ranked = self
            .ranking
            .fetch_ranking(self.config.ranking_limit)
            .await
            .context("fetching ranked repositories")?;
        let ranked_len = ranked.len();

        let enriched = self.enrich_metadata(ranked).await;
        let enriched = self.enrich_summaries(enriched).await;

        let metadata_present = enriched.iter().filter(|r| r.has_metadata()).count();
        let summaries_generated = enriched.iter().filter(|r| r.ai_summary.is_some()).count();

        let mut rows = normalize_rows(enriched);
        sort_rows(&mut rows);

        let csv_bytes = rows_to_csv(&rows)?;
        let file_name = ReportStore::dated_report_name(started_at.date_naive());
        let stored = self
            .store
            .store_bytes(&file_name, &csv_bytes)
            .await
            .context("writing report artifact")?;
        let published = self
            .store
            .publish(&stored, &self.config.publish_path)
            .await
            .context("publishing report artifact")?;

        let finished_at = Utc::now();
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            ranked: ranked_len,
            metadata_present,
            summaries_generated,
            report_path: stored.absolute_path.display().to_string(),
            published_path: published.display().to_string(),
            report_sha256: stored.sha256.clone(),
            report_bytes: stored.byte_size as u64,
        };
        self.write_run_summary(&summary).await?;
        info!(
            %run_id,
            ranked = ranked_len,
            metadata_present,
            summaries_generated,
            "trending sync run complete"
        );
        Ok(summary)
    }

    /// Metadata pass: one lookup per ranked entry, results merged back by
    /// position. A failed lookup leaves both metadata fields absent.
    async fn enrich_metadata(&self, ranked: Vec<RankedRepo>) -> Vec<EnrichedRepo> {
        let tasks: Vec<(usize, String)> = ranked
            .iter()
            .map(|repo| repo.repo_name.clone())
            .enumerate()
            .collect();
        let metadata = Arc::clone(&self.metadata);
        let completed = run_bounded("metadata", tasks, WORKER_CAP, |_, repo_name| {
            let metadata = Arc::clone(&metadata);
            async move { metadata.fetch_metadata(&repo_name).await }
        })
        .await;

        let slots = merge_by_index(ranked.len(), completed);
        ranked
            .into_iter()
            .zip(slots)
            .map(|(repo, slot)| {
                EnrichedRepo::from_ranked(repo)
                    .with_metadata(slot.unwrap_or_else(RepoMetadata::absent))
            })
            .collect()
    }

    /// Summary pass: only the first `summary_top_n` pre-sort positions are
    /// candidates, and of those only entries whose metadata pair is present
    /// are contacted; everything else keeps an absent summary.
    async fn enrich_summaries(&self, enriched: Vec<EnrichedRepo>) -> Vec<EnrichedRepo> {
        let tasks: Vec<(usize, SummaryRequest)> = enriched
            .iter()
            .enumerate()
            .take(self.config.summary_top_n)
            .filter_map(|(index, repo)| match (&repo.created_at, repo.current_star_count) {
                (Some(created_at), Some(current_stars)) => Some((
                    index,
                    SummaryRequest {
                        repo_name: repo.repo_name.clone(),
                        recent_stars: repo.star_count,
                        created_at: created_at.clone(),
                        current_stars,
                    },
                )),
                _ => None,
            })
            .collect();

        let summaries = Arc::clone(&self.summaries);
        let completed = run_bounded("summary", tasks, WORKER_CAP, |_, request| {
            let summaries = Arc::clone(&summaries);
            async move { summaries.generate(&request).await }
        })
        .await;

        let slots = merge_by_index(enriched.len(), completed);
        enriched
            .into_iter()
            .zip(slots)
            .map(|(mut repo, slot)| {
                repo.ai_summary = slot.flatten();
                repo
            })
            .collect()
    }

    async fn write_run_summary(&self, summary: &RunSummary) -> Result<()> {
        let runs_dir = self.store.output_dir().join("runs");
        tokio::fs::create_dir_all(&runs_dir)
            .await
            .with_context(|| format!("creating {}", runs_dir.display()))?;
        let path = runs_dir.join(format!("{}.json", summary.run_id));
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

pub async fn run_pipeline_once_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env()?;
    let pipeline = Pipeline::new(config)?;
    pipeline.run_once().await
}

/// Build the cron scheduler when enabled; each trigger performs one full run.
pub async fn maybe_build_scheduler(pipeline: Arc<Pipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    ranked = summary.ranked,
                    "scheduled sync run completed"
                ),
                Err(err) => warn!(error = %err, "scheduled sync run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Markdown digest of the most recent run summaries under `output_dir/runs`.
pub fn report_digest_markdown(runs: usize, output_dir: impl AsRef<Path>) -> Result<String> {
    let runs_dir = output_dir.as_ref().join("runs");
    let mut summaries = std::fs::read_dir(&runs_dir)
        .with_context(|| format!("reading {}", runs_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
        .filter_map(|entry| {
            let text = std::fs::read_to_string(entry.path()).ok()?;
            serde_json::from_str::<RunSummary>(&text).ok()
        })
        .collect::<Vec<_>>();
    summaries.sort_by_key(|summary| std::cmp::Reverse(summary.finished_at));
    summaries.truncate(runs.max(1));

    let mut lines = vec!["# Starwatch Run Digest".to_string(), String::new()];
    for summary in summaries {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- finished: {}", summary.finished_at.to_rfc3339()));
        lines.push(format!("- ranked repositories: {}", summary.ranked));
        lines.push(format!("- metadata present: {}", summary.metadata_present));
        lines.push(format!("- summaries generated: {}", summary.summaries_generated));
        lines.push(format!("- report: `{}`", summary.report_path));
        lines.push(format!("- published: `{}`", summary.published_path));
        lines.push(format!(
            "- sha256: `{}` ({} bytes)",
            summary.report_sha256, summary.report_bytes
        ));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
