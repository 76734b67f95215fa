//! Dirty-queue consumption shared by the detail and deep hydrators: claim, batch, commit,
//! checkpoint, complete.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wikisync_core::{
    CheckpointEntry, CheckpointOutcome, DeepIntent, DirtyPage, IdentityConflict, Lease, Phase,
};
use wikisync_storage::{
    CheckpointStore, DirtyQueueRepo, PageRepo, StoreError, SyncStore, VersionRepo,
};
use wikisync_upstream::{
    BatchBuilder, BatchItem, CostHints, FetchShape, GraphQlResponse, QueryBatch, RateLimiter,
    UpstreamError,
};

use crate::config::TuningConfig;
use crate::scheduler::{BatchHandler, SchedulerReport, TaskScheduler};

/// Counters for one Phase B or Phase C run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PhaseReport {
    /// Rows pending when the phase started.
    pub pending: usize,
    /// Pending rows this run already finished before a restart.
    pub skipped_checkpointed: usize,
    pub claimed: usize,
    /// Rows leased by another worker.
    pub not_claimed: usize,
    pub new_versions: usize,
    pub unchanged: usize,
    pub hydrated: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Leases handed back untouched (rate limited or cancelled).
    pub released: usize,
    pub identity_conflicts: usize,
    pub cancelled: bool,
    pub scheduler: SchedulerReport,
}

impl PhaseReport {
    pub fn committed(&self) -> usize {
        self.new_versions + self.unchanged + self.hydrated + self.deleted
    }

    fn count(&mut self, outcome: CheckpointOutcome) {
        match outcome {
            CheckpointOutcome::NewVersion => self.new_versions += 1,
            CheckpointOutcome::Unchanged | CheckpointOutcome::Scanned => self.unchanged += 1,
            CheckpointOutcome::Hydrated => self.hydrated += 1,
            CheckpointOutcome::Deleted => self.deleted += 1,
        }
    }
}

/// Borrowed view of the pipeline handed to a phase run.
pub(crate) struct PhaseContext<'a> {
    pub store: &'a dyn SyncStore,
    pub limiter: &'a RateLimiter,
    pub scheduler: &'a TaskScheduler,
    pub builder: &'a BatchBuilder,
    pub tuning: &'a TuningConfig,
    pub checkpoints: &'a CheckpointStore,
    pub owner: Uuid,
    pub cancel: &'a CancellationToken,
}

/// What a successful commit did, and what Phase B decided about deep hydration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Committed {
    pub outcome: CheckpointOutcome,
    pub deep: DeepIntent,
}

impl Committed {
    pub fn new(outcome: CheckpointOutcome) -> Self {
        Self {
            outcome,
            deep: DeepIntent::Keep,
        }
    }
}

#[derive(Debug)]
pub(crate) enum CommitError {
    /// The answer for this item is unusable; the row is failed, the run continues.
    Upstream(UpstreamError),
    /// The URL now belongs to a different upstream page.
    Conflict(IdentityConflict),
    Store(StoreError),
}

impl From<StoreError> for CommitError {
    fn from(err: StoreError) -> Self {
        CommitError::Store(err)
    }
}

impl From<UpstreamError> for CommitError {
    fn from(err: UpstreamError) -> Self {
        CommitError::Upstream(err)
    }
}

/// Attempts at a commit that lost the race for the current version.
pub(crate) const VERSION_RETRIES: usize = 3;

/// Per-phase persistence of one item's fetched answer.
#[async_trait]
pub(crate) trait Committer: Send + Sync {
    fn phase(&self) -> Phase;
    fn shape(&self) -> FetchShape;
    /// `values` holds one answer per sub-request of the batch, in order.
    async fn commit(
        &self,
        ctx: &PhaseContext<'_>,
        item: &BatchItem,
        values: &[Value],
    ) -> Result<Committed, CommitError>;
    async fn complete(
        &self,
        ctx: &PhaseContext<'_>,
        page_id: i64,
        committed: Committed,
    ) -> Result<bool, StoreError>;
}

struct PhaseHandler<'a, C> {
    ctx: &'a PhaseContext<'a>,
    committer: &'a C,
    report: Mutex<PhaseReport>,
}

impl<'a, C: Committer> PhaseHandler<'a, C> {
    async fn settle(&self, item: BatchItem, result: Result<Vec<Value>, UpstreamError>) -> Result<()> {
        let values = match result {
            Ok(values) => values,
            Err(err) => return self.fail_or_release(&item, err).await,
        };
        match self.committer.commit(self.ctx, &item, &values).await {
            Ok(committed) => self.finish(&item, committed).await,
            Err(CommitError::Upstream(err)) => self.fail_or_release(&item, err).await,
            Err(CommitError::Conflict(conflict)) => {
                let fresh = self
                    .ctx
                    .store
                    .record_identity_conflict(&conflict)
                    .await
                    .context("recording identity conflict")?;
                warn!(
                    page_id = conflict.page_id,
                    url = %conflict.url,
                    known = conflict.known_upstream_id,
                    observed = conflict.observed_upstream_id,
                    fresh,
                    "url now answers for a different upstream page; leaving for review"
                );
                self.report.lock().await.identity_conflicts += 1;
                let reason = format!(
                    "identity conflict: url {} answered upstream id {}",
                    conflict.url, conflict.observed_upstream_id
                );
                self.record_failure(item.page_id, &reason).await
            }
            Err(CommitError::Store(err)) => Err(anyhow::Error::new(err)
                .context(format!("committing page {} for {}", item.page_id, self.committer.phase()))),
        }
    }

    /// Checkpoint, then complete. A crash between the two leaves a checkpointed row that the
    /// resumed run skips and the next run picks up again.
    async fn finish(&self, item: &BatchItem, committed: Committed) -> Result<()> {
        let phase = self.committer.phase();
        self.ctx
            .checkpoints
            .append(&CheckpointEntry::for_page(phase, item.page_id, committed.outcome))
            .await
            .context("appending checkpoint")?;
        let completed = self
            .committer
            .complete(self.ctx, item.page_id, committed)
            .await
            .with_context(|| format!("completing {phase} for page {}", item.page_id))?;
        if !completed {
            warn!(page_id = item.page_id, %phase, "lease lost before completion");
        }
        debug!(page_id = item.page_id, outcome = ?committed.outcome, "committed");
        self.report.lock().await.count(committed.outcome);
        Ok(())
    }

    async fn fail_or_release(&self, item: &BatchItem, err: UpstreamError) -> Result<()> {
        if let UpstreamError::RateLimited { retry_after } = err {
            self.ctx.limiter.penalize(retry_after);
            return self.release(item.page_id).await;
        }
        warn!(page_id = item.page_id, url = %item.url, error = %err, "item failed");
        self.record_failure(item.page_id, &err.to_string()).await
    }

    async fn record_failure(&self, page_id: i64, reason: &str) -> Result<()> {
        self.ctx
            .store
            .record_failure(page_id, self.committer.phase(), self.ctx.owner, reason, Utc::now())
            .await
            .with_context(|| format!("recording failure for page {page_id}"))?;
        self.report.lock().await.failed += 1;
        Ok(())
    }

    async fn release(&self, page_id: i64) -> Result<()> {
        self.ctx
            .store
            .release(page_id, self.committer.phase(), self.ctx.owner)
            .await
            .with_context(|| format!("releasing lease on page {page_id}"))?;
        self.report.lock().await.released += 1;
        Ok(())
    }
}

#[async_trait]
impl<'a, C: Committer> BatchHandler for PhaseHandler<'a, C> {
    async fn on_success(&self, batch: QueryBatch, responses: Vec<GraphQlResponse>) -> Result<()> {
        for outcome in batch.split(&responses) {
            self.settle(outcome.item, outcome.result).await?;
        }
        Ok(())
    }

    async fn on_failure(&self, batch: QueryBatch, error: UpstreamError) -> Result<()> {
        for item in &batch.items {
            self.fail_or_release(item, error.clone()).await?;
        }
        Ok(())
    }

    async fn on_skipped(&self, batch: QueryBatch) -> Result<()> {
        for item in &batch.items {
            self.release(item.page_id).await?;
        }
        Ok(())
    }
}

/// Take leases on `rows` and turn the ones we won into batch items.
async fn claim_items(
    ctx: &PhaseContext<'_>,
    phase: Phase,
    rows: &[DirtyPage],
    report: &mut PhaseReport,
) -> Result<Vec<BatchItem>> {
    let ttl = ctx.tuning.lease_ttl();
    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let lease = Lease::new(ctx.owner, Utc::now());
        if !ctx.store.claim(row.page_id, phase, lease, ttl).await? {
            report.not_claimed += 1;
            continue;
        }
        report.claimed += 1;

        let Some(page) = ctx.store.page(row.page_id).await? else {
            ctx.store
                .record_failure(row.page_id, phase, ctx.owner, "page row missing", Utc::now())
                .await?;
            report.failed += 1;
            continue;
        };
        let hints = ctx
            .store
            .current_version(row.page_id)
            .await?
            .map(|v| CostHints {
                vote_count: v.state.vote_count,
                revision_count: v.state.revision_count,
            })
            .unwrap_or_default();
        items.push(BatchItem {
            page_id: page.id,
            url: page.url,
            hints,
        });
    }
    Ok(items)
}

/// Drain every pending row of the committer's phase, cheapest first.
///
/// Rows are claimed a scheduler-window at a time so leases never sit idle behind a long queue.
pub(crate) async fn drain_queue<C: Committer>(
    ctx: &PhaseContext<'_>,
    committer: &C,
) -> Result<PhaseReport> {
    let phase = committer.phase();
    let processed = ctx
        .checkpoints
        .load_processed(phase)
        .await
        .context("loading checkpoint log")?;
    let pending = ctx.store.pending(phase, None).await?;

    let mut report = PhaseReport {
        pending: pending.len(),
        ..Default::default()
    };
    let mut work = Vec::with_capacity(pending.len());
    for row in pending {
        if processed.contains(&row.page_id.to_string()) {
            report.skipped_checkpointed += 1;
        } else {
            work.push(row);
        }
    }
    info!(
        %phase,
        pending = report.pending,
        skipped = report.skipped_checkpointed,
        "draining dirty queue"
    );

    let handler = PhaseHandler {
        ctx,
        committer,
        report: Mutex::new(PhaseReport::default()),
    };
    let window = (ctx.tuning.scheduler.concurrency * ctx.builder.limits().max_first).max(1);
    for rows in work.chunks(window) {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let items = claim_items(ctx, phase, rows, &mut report).await?;
        if items.is_empty() {
            continue;
        }
        let batches = ctx.builder.build(committer.shape(), items);
        let run = ctx.scheduler.run(batches, &handler).await?;
        report.scheduler.absorb(run);
    }
    report.cancelled = ctx.cancel.is_cancelled();

    let handled = handler.report.into_inner();
    report.new_versions += handled.new_versions;
    report.unchanged += handled.unchanged;
    report.hydrated += handled.hydrated;
    report.deleted += handled.deleted;
    report.failed += handled.failed;
    report.released += handled.released;
    report.identity_conflicts += handled.identity_conflicts;

    info!(
        %phase,
        committed = report.committed(),
        new_versions = report.new_versions,
        failed = report.failed,
        released = report.released,
        cancelled = report.cancelled,
        "phase finished"
    );
    Ok(report)
}
