//! Three-phase sync orchestration: metadata scan, detail hydration, deep hydration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use wikisync_core::{
    check_version_chain, DirtyMark, DirtyReason, Phase, QueueSummary, VersionChainIssue,
};
use wikisync_storage::{
    CheckpointStore, DirtyQueueRepo, PageRepo, PgStore, SyncStore, VersionRepo,
};
use wikisync_upstream::{
    BatchBuilder, CostEstimator, GraphQlTransport, HttpClientConfig, HttpTransport, RateLimiter,
};

pub mod config;
mod deep;
mod detail;
mod phase;
pub mod refgraph;
mod scanner;
pub mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{ConfigError, SyncConfig, TuningConfig};
pub use phase::PhaseReport;
pub use refgraph::{extract_edges, PageEdges, ReferenceEdge, ReferenceGraphPool, RefGraphError};
pub use scanner::{ScanReport, SCAN_COMPLETE};
pub use scheduler::{BatchHandler, SchedulerReport, TaskScheduler};

use deep::DeepCommitter;
use detail::DetailCommitter;
use phase::{drain_queue, PhaseContext};
use scanner::Scanner;

pub const CRATE_NAME: &str = "wikisync-sync";

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    /// Continued a run interrupted by a previous process.
    pub resumed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub scan: ScanReport,
    pub phase_b: PhaseReport,
    pub phase_c: PhaseReport,
    pub queue: QueueSummary,
}

/// Outcome of seeding a manual re-check.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SeedReport {
    pub marked: Vec<i64>,
    /// URLs with no stored page; Phase A has to discover them first.
    pub unknown: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionChainReport {
    pub page_id: i64,
    pub versions: usize,
    pub issues: Vec<VersionChainIssue>,
}

pub struct SyncPipeline {
    store: Arc<dyn SyncStore>,
    transport: Arc<dyn GraphQlTransport>,
    limiter: Arc<RateLimiter>,
    builder: BatchBuilder,
    tuning: TuningConfig,
    checkpoint_root: PathBuf,
    worker_id: Uuid,
    cancel: CancellationToken,
    cron: Option<String>,
    /// Held for the length of a run; overlapping cron ticks skip instead of queueing.
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    /// Postgres store and HTTP transport, as configured by the environment.
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let tuning = TuningConfig::load(&config.tuning_file)
            .await
            .context("loading tuning file")?;
        let store = PgStore::connect(&config.database_url, config.db_max_connections).await?;
        let transport = HttpTransport::new(HttpClientConfig {
            endpoint: config.endpoint.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let mut pipeline = Self::from_parts(
            Arc::new(store),
            Arc::new(transport),
            tuning,
            config.checkpoint_dir.clone(),
        )?;
        pipeline.cron = config.scheduler_enabled.then(|| config.sync_cron.clone());
        Ok(pipeline)
    }

    pub fn from_parts(
        store: Arc<dyn SyncStore>,
        transport: Arc<dyn GraphQlTransport>,
        tuning: TuningConfig,
        checkpoint_root: PathBuf,
    ) -> Result<Self> {
        tuning.validate()?;
        let estimator = CostEstimator::new(tuning.cost.clone())?;
        Ok(Self {
            store,
            transport,
            limiter: Arc::new(RateLimiter::new(tuning.rate_limit)),
            builder: BatchBuilder::new(estimator, tuning.batching),
            tuning,
            checkpoint_root,
            worker_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            cron: None,
            run_lock: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn tuning(&self) -> &TuningConfig {
        &self.tuning
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Token that stops the pipeline between batches.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn open_checkpoints(&self) -> Result<CheckpointStore> {
        CheckpointStore::open_or_resume(self.checkpoint_root.clone())
            .await
            .with_context(|| format!("opening checkpoints under {}", self.checkpoint_root.display()))
    }

    fn task_scheduler(&self) -> TaskScheduler {
        TaskScheduler::new(
            self.transport.clone(),
            self.limiter.clone(),
            self.tuning.scheduler.concurrency,
            self.tuning.backoff(),
            self.cancel.clone(),
        )
    }

    pub async fn run_phase_a(&self, checkpoints: &CheckpointStore) -> Result<ScanReport> {
        let scanner = Scanner {
            store: self.store.as_ref(),
            transport: self.transport.as_ref(),
            limiter: &self.limiter,
            builder: &self.builder,
            tuning: &self.tuning,
            backoff: self.tuning.backoff(),
            checkpoints,
            cancel: &self.cancel,
        };
        scanner
            .run()
            .instrument(info_span!("phase", phase = %Phase::A, run_id = %checkpoints.run_id()))
            .await
    }

    pub async fn run_phase_b(&self, checkpoints: &CheckpointStore) -> Result<PhaseReport> {
        self.drain(checkpoints, Phase::B).await
    }

    pub async fn run_phase_c(&self, checkpoints: &CheckpointStore) -> Result<PhaseReport> {
        self.drain(checkpoints, Phase::C).await
    }

    async fn drain(&self, checkpoints: &CheckpointStore, phase: Phase) -> Result<PhaseReport> {
        let scheduler = self.task_scheduler();
        let ctx = PhaseContext {
            store: self.store.as_ref(),
            limiter: &self.limiter,
            scheduler: &scheduler,
            builder: &self.builder,
            tuning: &self.tuning,
            checkpoints,
            owner: self.worker_id,
            cancel: &self.cancel,
        };
        let span = info_span!("phase", %phase, run_id = %checkpoints.run_id());
        match phase {
            Phase::A => anyhow::bail!("phase a is not a dirty-queue consumer"),
            Phase::B => drain_queue(&ctx, &DetailCommitter).instrument(span).await,
            Phase::C => drain_queue(&ctx, &DeepCommitter).instrument(span).await,
        }
    }

    /// Full A→B→C pass. The checkpoint run is closed only when nothing was cancelled, so an
    /// interrupted pass resumes where it stopped.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _running = self.run_lock.lock().await;
        self.run_locked().await
    }

    /// Like [`Self::run_once`] but returns `None` instead of waiting when a run is in progress.
    pub async fn try_run_once(&self) -> Result<Option<SyncRunSummary>> {
        let Ok(_running) = self.run_lock.try_lock() else {
            return Ok(None);
        };
        self.run_locked().await.map(Some)
    }

    /// Caller holds `run_lock`.
    async fn run_locked(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let checkpoints = self.open_checkpoints().await?;
        let run_id = checkpoints.run_id();
        info!(%run_id, resumed = checkpoints.resumed(), worker = %self.worker_id, "sync run starting");

        let scan = self.run_phase_a(&checkpoints).await.context("phase a")?;
        let phase_b = if scan.cancelled {
            PhaseReport::default()
        } else {
            self.run_phase_b(&checkpoints).await.context("phase b")?
        };
        let phase_c = if self.cancel.is_cancelled() {
            PhaseReport::default()
        } else {
            self.run_phase_c(&checkpoints).await.context("phase c")?
        };

        let cancelled = self.cancel.is_cancelled();
        if !cancelled {
            checkpoints.finish().await.context("closing checkpoint run")?;
        }
        let queue = self.store.queue_summary().await?;
        let finished_at = Utc::now();
        info!(
            %run_id,
            cancelled,
            dirty = scan.dirty_marked,
            b_committed = phase_b.committed(),
            c_committed = phase_c.committed(),
            pending_b = queue.pending_b,
            pending_c = queue.pending_c,
            "sync run finished"
        );

        Ok(SyncRunSummary {
            run_id,
            resumed: checkpoints.resumed(),
            started_at,
            finished_at,
            cancelled,
            scan,
            phase_b,
            phase_c,
            queue,
        })
    }

    /// Force a Phase B re-check of pages by URL.
    pub async fn seed_urls(&self, urls: &[String]) -> Result<SeedReport> {
        let mut report = SeedReport::default();
        let mark = DirtyMark {
            need_phase_b: true,
            reasons: vec![DirtyReason::ManualRecheck],
            ..Default::default()
        };
        for url in urls {
            match self.store.page_by_url(url).await? {
                Some(page) => {
                    self.store.mark_dirty(page.id, &mark, Utc::now()).await?;
                    report.marked.push(page.id);
                }
                None => {
                    warn!(%url, "no stored page for url; not seeded");
                    report.unknown.push(url.clone());
                }
            }
        }
        Ok(report)
    }

    pub async fn queue_summary(&self) -> Result<QueueSummary> {
        Ok(self.store.queue_summary().await?)
    }

    pub async fn check_pages(&self, page_ids: &[i64]) -> Result<Vec<VersionChainReport>> {
        let mut reports = Vec::with_capacity(page_ids.len());
        for &page_id in page_ids {
            let versions = self.store.versions(page_id).await?;
            reports.push(VersionChainReport {
                page_id,
                versions: versions.len(),
                issues: check_version_chain(&versions),
            });
        }
        Ok(reports)
    }

    pub fn reference_graph_pool(&self) -> ReferenceGraphPool {
        ReferenceGraphPool::start(self.store.clone(), self.tuning.refgraph.workers)
    }

    /// Cron job running [`Self::run_once`] when scheduling is enabled. A tick that lands while a
    /// run is still going is skipped.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        let Some(cron) = self.cron.clone() else {
            return Ok(None);
        };

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.try_run_once().await {
                    Ok(Some(summary)) => info!(run_id = %summary.run_id, "scheduled sync complete"),
                    Ok(None) => warn!("previous sync still running; skipping scheduled tick"),
                    Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn build_pipeline_from_env() -> Result<SyncPipeline> {
    SyncPipeline::new(SyncConfig::from_env()).await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    build_pipeline_from_env().await?.run_once().await
}
