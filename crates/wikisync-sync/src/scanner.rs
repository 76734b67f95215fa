//! Phase A: catalog scan into staging, then the dirty diff against current versions.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wikisync_core::{
    CheckpointEntry, DirtyMark, DirtyReason, IdentityConflict, Page, PageMetaStaging, Phase,
};
use wikisync_storage::{
    CheckpointStore, DirtyQueueRepo, PageRepo, StagingRepo, SyncStore, VersionRepo,
};
use wikisync_upstream::parse::{catalog_request, parse_catalog};
use wikisync_upstream::{
    BackoffPolicy, BatchBuilder, CatalogPage, CostHints, GraphQlTransport, QueryShape,
    RateLimiter, UpstreamError,
};

use crate::config::TuningConfig;

/// Checkpoint key written once pagination has reached the end of the catalog.
pub const SCAN_COMPLETE: &str = "#done";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ScanReport {
    /// Cursor the scan resumed after, when a previous attempt was interrupted.
    pub resumed_after: Option<String>,
    pub catalog_pages: usize,
    pub staged_rows: usize,
    pub dirty_marked: usize,
    pub new_pages: usize,
    pub renamed_pages: usize,
    pub identity_conflicts: usize,
    pub rate_limited: usize,
    pub retries: usize,
    /// Stopped between catalog pages; the diff did not run.
    pub cancelled: bool,
}

/// Where pagination stands for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanState {
    Fresh,
    ResumeAfter(String),
    Paginated,
}

pub(crate) struct Scanner<'a> {
    pub store: &'a dyn SyncStore,
    pub transport: &'a dyn GraphQlTransport,
    pub limiter: &'a RateLimiter,
    pub builder: &'a BatchBuilder,
    pub tuning: &'a TuningConfig,
    pub backoff: BackoffPolicy,
    pub checkpoints: &'a CheckpointStore,
    pub cancel: &'a CancellationToken,
}

impl Scanner<'_> {
    pub async fn run(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let state = match self.checkpoints.last_key(Phase::A).await? {
            None => ScanState::Fresh,
            Some(key) if key == SCAN_COMPLETE => ScanState::Paginated,
            Some(cursor) => ScanState::ResumeAfter(cursor),
        };

        match state {
            ScanState::Paginated => {
                info!("catalog already paginated this run; going straight to diff");
            }
            ScanState::Fresh => {
                self.store.clear_staging().await.context("clearing staging")?;
                if !self.paginate(None, &mut report).await? {
                    return Ok(report);
                }
            }
            ScanState::ResumeAfter(cursor) => {
                info!(%cursor, "resuming catalog scan");
                report.resumed_after = Some(cursor.clone());
                if !self.paginate(Some(cursor), &mut report).await? {
                    return Ok(report);
                }
            }
        }

        self.diff(&mut report).await?;
        info!(
            staged = report.staged_rows,
            dirty = report.dirty_marked,
            new_pages = report.new_pages,
            renamed = report.renamed_pages,
            conflicts = report.identity_conflicts,
            "metadata scan finished"
        );
        Ok(report)
    }

    /// Returns false when cancelled before the catalog was exhausted.
    async fn paginate(&self, mut after: Option<String>, report: &mut ScanReport) -> Result<bool> {
        let page_size = self.builder.catalog_page_size();
        let estimator = self.builder.estimator();
        let cost = estimator.request_cost(
            QueryShape::Catalog,
            std::iter::repeat(&CostHints::default()).take(page_size),
        );

        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(false);
            }
            let page = self.fetch_catalog(page_size, after.as_deref(), cost, report).await?;
            report.catalog_pages += 1;

            let seen_at = Utc::now();
            let rows = page
                .nodes
                .iter()
                .map(|node| node.to_staging(estimator.deep_cost(&node.hints()), seen_at))
                .collect::<Vec<_>>();
            self.store
                .upsert_staging(&rows)
                .await
                .context("writing staging rows")?;
            debug!(rows = rows.len(), cursor = ?page.end_cursor, "staged catalog page");

            match page.end_cursor {
                Some(cursor) if page.has_next_page => {
                    self.checkpoints
                        .append(&CheckpointEntry::for_cursor(&cursor))
                        .await?;
                    after = Some(cursor);
                }
                _ => break,
            }
        }

        self.checkpoints
            .append(&CheckpointEntry::for_cursor(SCAN_COMPLETE))
            .await?;
        Ok(true)
    }

    /// One catalog page, retrying transient failures and waiting out rate limits.
    async fn fetch_catalog(
        &self,
        first: usize,
        after: Option<&str>,
        cost: u32,
        report: &mut ScanReport,
    ) -> Result<CatalogPage> {
        let request = catalog_request(first, after);
        let mut attempt = 0usize;
        loop {
            self.limiter.acquire(cost).await;
            let result = match self.transport.execute(&request).await {
                Ok(response) => parse_catalog(&response),
                Err(err) => Err(err),
            };
            match result {
                Ok(page) => return Ok(page),
                Err(UpstreamError::RateLimited { retry_after }) => {
                    report.rate_limited += 1;
                    self.limiter.penalize(retry_after);
                }
                Err(err) if err.is_transient() && self.backoff.allows_retry(attempt) => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt, ?after, error = %err, delay_ms = delay.as_millis() as u64, "catalog fetch failed; retrying");
                    report.retries += 1;
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => bail!("catalog page after {:?} failed: {err}", after),
            }
        }
    }

    async fn diff(&self, report: &mut ScanReport) -> Result<()> {
        let rows = self.store.staging_rows().await.context("reading staging")?;
        report.staged_rows = rows.len();
        for row in &rows {
            let Some(page) = self.resolve_identity(row, report).await? else {
                continue;
            };
            let current = self.store.current_version(page.id).await?;
            let before = current.as_ref().map(|v| &v.state);
            let reasons = row.diff_reasons(before);
            if reasons.is_empty() {
                continue;
            }

            let need_phase_c = self.needs_deep(row, before.is_some(), &reasons, row.revision_jump(before));
            let mark = DirtyMark {
                need_phase_b: true,
                need_phase_c,
                reasons,
                estimated_cost: Some(row.estimated_cost),
            };
            self.store
                .mark_dirty(page.id, &mark, Utc::now())
                .await
                .with_context(|| format!("marking page {} dirty", page.id))?;
            report.dirty_marked += 1;
        }
        Ok(())
    }

    /// Large revision jumps always imply new deep content. Smaller moves only skip straight to
    /// Phase C for pages cheap enough to hydrate inline.
    fn needs_deep(&self, row: &PageMetaStaging, known: bool, reasons: &[DirtyReason], jump: i64) -> bool {
        if row.is_deleted {
            return false;
        }
        let revisions_moved = !known || reasons.contains(&DirtyReason::RevisionCountChanged);
        jump >= self.tuning.dirty.deep_revision_jump
            || (revisions_moved && row.estimated_cost <= self.tuning.dirty.simple_page_threshold)
    }

    /// Map a staged row onto a stored page. `None` when the URL now answers for a different
    /// upstream page than the one on record.
    async fn resolve_identity(
        &self,
        row: &PageMetaStaging,
        report: &mut ScanReport,
    ) -> Result<Option<Page>> {
        let now = Utc::now();
        if let Some(page) = self.store.page_by_url(&row.url).await? {
            if page.upstream_id == row.upstream_id {
                return Ok(Some(page));
            }
            let conflict = IdentityConflict {
                page_id: page.id,
                url: row.url.clone(),
                known_upstream_id: page.upstream_id,
                observed_upstream_id: row.upstream_id,
                observed_at: now,
            };
            let fresh = self.store.record_identity_conflict(&conflict).await?;
            warn!(
                page_id = page.id,
                url = %row.url,
                known = page.upstream_id,
                observed = row.upstream_id,
                fresh,
                "url recreated under a new upstream id; leaving for review"
            );
            report.identity_conflicts += 1;
            return Ok(None);
        }

        if let Some(page) = self.store.page_by_upstream_id(row.upstream_id).await? {
            info!(page_id = page.id, from = %page.url, to = %row.url, "page renamed upstream");
            self.store.update_page_url(page.id, &row.url, now).await?;
            report.renamed_pages += 1;
            return Ok(Some(Page {
                url: row.url.clone(),
                updated_at: now,
                ..page
            }));
        }

        let page = self.store.insert_page(row.upstream_id, &row.url, now).await?;
        report.new_pages += 1;
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use wikisync_core::PageState;
    use wikisync_storage::MemoryStore;
    use wikisync_upstream::CostEstimator;

    use crate::config::tests::SAMPLE;
    use crate::testing::{FakePage, ScriptedTransport};

    struct Fixture {
        store: MemoryStore,
        transport: Arc<ScriptedTransport>,
        limiter: RateLimiter,
        builder: BatchBuilder,
        tuning: TuningConfig,
        checkpoints: CheckpointStore,
        cancel: CancellationToken,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        async fn new() -> Self {
            let tuning = TuningConfig::from_yaml_str(SAMPLE, "inline").expect("tuning");
            let dir = tempfile::tempdir().expect("tempdir");
            let checkpoints = CheckpointStore::open_or_resume(dir.path())
                .await
                .expect("checkpoints");
            Self {
                store: MemoryStore::new(),
                transport: Arc::new(ScriptedTransport::default()),
                limiter: RateLimiter::new(tuning.rate_limit),
                builder: BatchBuilder::new(
                    CostEstimator::new(tuning.cost.clone()).expect("estimator"),
                    tuning.batching,
                ),
                tuning,
                checkpoints,
                cancel: CancellationToken::new(),
                _dir: dir,
            }
        }

        fn scanner(&self) -> Scanner<'_> {
            Scanner {
                store: &self.store,
                transport: self.transport.as_ref(),
                limiter: &self.limiter,
                builder: &self.builder,
                tuning: &self.tuning,
                backoff: self.tuning.backoff(),
                checkpoints: &self.checkpoints,
                cancel: &self.cancel,
            }
        }
    }

    fn fake(upstream_id: i64, rating: i64, revisions: i64) -> FakePage {
        FakePage {
            upstream_id,
            title: format!("page {upstream_id}"),
            rating,
            vote_count: 4,
            revision_count: revisions,
            ..Default::default()
        }
    }

    fn stored_state(rating: i64, revisions: i64) -> PageState {
        PageState {
            title: Some("page 7".into()),
            rating: Some(rating),
            vote_count: Some(4),
            revision_count: Some(revisions),
            tags: BTreeSet::new(),
            is_deleted: false,
            source: Some("body".into()),
            text_content: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rating_change_marks_phase_b_only() {
        let fx = Fixture::new().await;
        let page = fx.store.insert_page(7, "scp-7", Utc::now()).await.expect("page");
        fx.store
            .open_version(page.id, None, &stored_state(100, 2), Utc::now())
            .await
            .expect("version");
        fx.transport.upsert_page("scp-7", fake(7, 120, 2));

        let report = fx.scanner().run().await.expect("scan");
        assert_eq!(report.dirty_marked, 1);
        let row = fx.store.dirty_page(page.id).await.expect("read").expect("row");
        assert!(row.need_phase_b);
        assert!(!row.need_phase_c);
        assert_eq!(row.reasons, vec![DirtyReason::RatingChanged]);
    }

    #[tokio::test(start_paused = true)]
    async fn revision_jump_marks_phase_c_directly() {
        let fx = Fixture::new().await;
        let page = fx.store.insert_page(7, "scp-7", Utc::now()).await.expect("page");
        fx.store
            .open_version(page.id, None, &stored_state(100, 2), Utc::now())
            .await
            .expect("version");
        fx.transport.upsert_page("scp-7", fake(7, 100, 9));

        fx.scanner().run().await.expect("scan");
        let row = fx.store.dirty_page(page.id).await.expect("read").expect("row");
        assert!(row.need_phase_c);
        assert!(row.reasons.contains(&DirtyReason::RevisionCountChanged));
    }

    #[tokio::test(start_paused = true)]
    async fn paginates_past_one_page_and_stages_everything() {
        let fx = Fixture::new().await;
        let size = fx.builder.catalog_page_size();
        for i in 0..(size as i64 * 2 + 3) {
            fx.transport.upsert_page(&format!("p-{i:03}"), fake(i + 1, 1, 1));
        }

        let report = fx.scanner().run().await.expect("scan");
        assert_eq!(report.catalog_pages, 3);
        assert_eq!(report.staged_rows, size * 2 + 3);
        assert_eq!(report.new_pages, size * 2 + 3);
        assert_eq!(
            fx.checkpoints.last_key(Phase::A).await.expect("last").as_deref(),
            Some(SCAN_COMPLETE)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_catalog_errors_are_retried() {
        let fx = Fixture::new().await;
        fx.transport.upsert_page("scp-1", fake(1, 1, 1));
        fx.transport
            .fail_any("CatalogPage", UpstreamError::Transient("502".into()), 2);

        let report = fx.scanner().run().await.expect("scan");
        assert_eq!(report.retries, 2);
        assert_eq!(report.staged_rows, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_catalog_error_aborts_the_scan() {
        let fx = Fixture::new().await;
        fx.transport.upsert_page("scp-1", fake(1, 1, 1));
        fx.transport
            .fail_any("CatalogPage", UpstreamError::Permanent("schema".into()), 1);

        assert!(fx.scanner().run().await.is_err());
        assert!(fx.store.staging_rows().await.expect("staging").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recreated_url_is_a_conflict_not_dirty() {
        let fx = Fixture::new().await;
        let page = fx.store.insert_page(7, "scp-7", Utc::now()).await.expect("page");
        fx.transport.upsert_page("scp-7", fake(70, 1, 1));

        let report = fx.scanner().run().await.expect("scan");
        assert_eq!(report.identity_conflicts, 1);
        assert_eq!(report.dirty_marked, 0);
        assert!(fx.store.dirty_page(page.id).await.expect("read").is_none());
        assert_eq!(fx.store.identity_conflicts().await.expect("conflicts").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn moved_page_keeps_its_identity() {
        let fx = Fixture::new().await;
        let page = fx.store.insert_page(7, "old-url", Utc::now()).await.expect("page");
        fx.store
            .open_version(page.id, None, &stored_state(100, 2), Utc::now())
            .await
            .expect("version");
        fx.transport.upsert_page("new-url", fake(7, 100, 2));

        let report = fx.scanner().run().await.expect("scan");
        assert_eq!(report.renamed_pages, 1);
        assert_eq!(report.new_pages, 0);
        let moved = fx.store.page(page.id).await.expect("read").expect("page");
        assert_eq!(moved.url, "new-url");
    }
}
